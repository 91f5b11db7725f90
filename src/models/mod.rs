pub mod device;
pub mod observation;

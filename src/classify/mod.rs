use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use once_cell::sync::Lazy;

use crate::models::device::{DeviceType, OwnerCategory};
use crate::models::observation::Observation;

/// How many hostname lookups to memoize
const CACHE_SIZE: usize = 4_096;

/// Device-type keywords, checked in order against the lowercased
/// hostname; first match wins. More specific names sit above the
/// generic ones they contain ("iphone" before "phone").
static DEVICE_KEYWORDS: Lazy<Vec<(&'static str, DeviceType)>> = Lazy::new(|| {
    vec![
        ("iphone", DeviceType::Smartphone),
        ("ipad", DeviceType::Tablet),
        ("macbook", DeviceType::Laptop),
        ("imac", DeviceType::Desktop),
        ("android", DeviceType::Smartphone),
        ("pixel", DeviceType::Smartphone),
        ("galaxy", DeviceType::Smartphone),
        ("phone", DeviceType::Smartphone),
        ("tablet", DeviceType::Tablet),
        ("laptop", DeviceType::Laptop),
        ("thinkpad", DeviceType::Laptop),
        ("notebook", DeviceType::Laptop),
        ("desktop", DeviceType::Desktop),
        ("workstation", DeviceType::Desktop),
        ("appletv", DeviceType::SmartTv),
        ("apple-tv", DeviceType::SmartTv),
        ("chromecast", DeviceType::SmartTv),
        ("roku", DeviceType::SmartTv),
        ("firestick", DeviceType::SmartTv),
        ("fire-tv", DeviceType::SmartTv),
        ("bravia", DeviceType::SmartTv),
        ("-tv", DeviceType::SmartTv),
        ("tv-", DeviceType::SmartTv),
        ("smarttv", DeviceType::SmartTv),
        ("playstation", DeviceType::GameConsole),
        ("ps4", DeviceType::GameConsole),
        ("ps5", DeviceType::GameConsole),
        ("xbox", DeviceType::GameConsole),
        ("nintendo", DeviceType::GameConsole),
        ("switch", DeviceType::GameConsole),
        ("homepod", DeviceType::SmartSpeaker),
        ("echo", DeviceType::SmartSpeaker),
        ("alexa", DeviceType::SmartSpeaker),
        ("sonos", DeviceType::SmartSpeaker),
        ("google-home", DeviceType::SmartSpeaker),
        ("router", DeviceType::Router),
        ("gateway", DeviceType::Router),
        ("unifi", DeviceType::Router),
        ("openwrt", DeviceType::Router),
        ("doorbell", DeviceType::Camera),
        ("camera", DeviceType::Camera),
        ("webcam", DeviceType::Camera),
        ("-cam", DeviceType::Camera),
        ("cam-", DeviceType::Camera),
        ("printer", DeviceType::Printer),
        ("epson", DeviceType::Printer),
        ("brother", DeviceType::Printer),
        ("deskjet", DeviceType::Printer),
        ("laserjet", DeviceType::Printer),
        ("thermostat", DeviceType::Iot),
        ("hue", DeviceType::Iot),
        ("bulb", DeviceType::Iot),
        ("plug", DeviceType::Iot),
        ("sensor", DeviceType::Iot),
        ("shelly", DeviceType::Iot),
        ("tasmota", DeviceType::Iot),
    ]
});

/// Owner-category keywords, same matching discipline on its own axis
static OWNER_KEYWORDS: Lazy<Vec<(&'static str, OwnerCategory)>> = Lazy::new(|| {
    vec![
        ("teen", OwnerCategory::Teenager),
        ("kid", OwnerCategory::Child),
        ("child", OwnerCategory::Child),
        ("junior", OwnerCategory::Child),
        ("mom", OwnerCategory::Adult),
        ("dad", OwnerCategory::Adult),
        ("parent", OwnerCategory::Adult),
        ("office", OwnerCategory::Adult),
        ("work", OwnerCategory::Adult),
        ("guest", OwnerCategory::Guest),
        ("visitor", OwnerCategory::Guest),
    ]
});

/// OS-hint keywords, a secondary device-axis signal used only when the
/// hostname did not match
static OS_KEYWORDS: Lazy<Vec<(&'static str, DeviceType)>> = Lazy::new(|| {
    vec![
        ("android", DeviceType::Smartphone),
        ("ios", DeviceType::Smartphone),
        ("ipados", DeviceType::Tablet),
        ("windows", DeviceType::Desktop),
        ("mac os", DeviceType::Laptop),
        ("macos", DeviceType::Laptop),
        ("tvos", DeviceType::SmartTv),
    ]
});

/// Port heuristics, the lowest-priority device-axis signal
static PORT_HINTS: &[(u16, DeviceType)] = &[
    (9100, DeviceType::Printer), // raw printing
    (515, DeviceType::Printer),  // lpd
    (554, DeviceType::Camera),   // rtsp
    (8009, DeviceType::SmartTv), // cast
    (3389, DeviceType::Desktop), // rdp
];

/// Result of a classification pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub device_type: DeviceType,
    pub owner_category: OwnerCategory,
}

/// Hostname/port heuristic classifier. Deterministic: the same
/// observation always classifies the same way, and there is no state
/// beyond a lookup memo.
pub struct Classifier {
    // Memoizes the hostname-table lookup only; port and OS signals are
    // cheap and applied per call.
    hostname_cache: Mutex<LruCache<String, (Option<DeviceType>, Option<OwnerCategory>)>>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            hostname_cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_SIZE).unwrap())),
        }
    }

    /// Map a raw observation to (device type, owner category).
    ///
    /// Hostname keywords are the primary signal on both axes; the OS
    /// hint and then responsive ports fill in the device axis only when
    /// the hostname missed. Fallback is (Unknown, Unknown).
    pub fn classify(&self, observation: &Observation) -> Classification {
        let (mut device_type, owner_category) = match &observation.hostname {
            Some(hostname) => self.hostname_lookup(hostname),
            None => (None, None),
        };

        if device_type.is_none() {
            if let Some(hint) = &observation.os_hint {
                let hint = hint.to_lowercase();
                device_type = OS_KEYWORDS
                    .iter()
                    .find(|(kw, _)| hint.contains(kw))
                    .map(|(_, t)| *t);
            }
        }

        if device_type.is_none() {
            device_type = PORT_HINTS
                .iter()
                .find(|(port, _)| observation.open_ports.contains(port))
                .map(|(_, t)| *t);
        }

        Classification {
            device_type: device_type.unwrap_or(DeviceType::Unknown),
            owner_category: owner_category.unwrap_or(OwnerCategory::Unknown),
        }
    }

    fn hostname_lookup(&self, hostname: &str) -> (Option<DeviceType>, Option<OwnerCategory>) {
        let key = hostname.to_lowercase();

        if let Some(hit) = self
            .hostname_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return *hit;
        }

        let device_type = DEVICE_KEYWORDS
            .iter()
            .find(|(kw, _)| key.contains(kw))
            .map(|(_, t)| *t);
        let owner_category = OWNER_KEYWORDS
            .iter()
            .find(|(kw, _)| key.contains(kw))
            .map(|(_, c)| *c);

        self.hostname_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, (device_type, owner_category));
        (device_type, owner_category)
    }
}

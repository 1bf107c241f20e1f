//! mDNS / DNS-SD discovery: publishing this gateway's beacon and browsing
//! for peers.

pub mod beacon;
pub mod browser;
pub mod publisher;

pub use beacon::{decode_dnssd_escapes, encode_dnssd_escapes, Beacon};
pub use browser::{browse, BeaconCache};
pub use publisher::{
    conflict_name, wide_area_records, DiscoveryPublisher, SERVICE_TYPE, WIDE_AREA_DOMAIN,
};

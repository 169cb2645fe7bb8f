//! A clock built against a newer extension API than the host provides
//!
//! The host must reject it before calling into the type table.

use launchpad::extensions::{ExtensionMetadata, ExtensionType, API_VERSION};

#[no_mangle]
pub static LAUNCHPAD_API_VERSION: u32 = API_VERSION + 1;

#[no_mangle]
pub fn launchpad_extension_table() -> Vec<ExtensionType> {
    vec![ExtensionType::opaque("Clock")
        .with_metadata(ExtensionMetadata::new("clock", "Clock", "2.0.0"))]
}

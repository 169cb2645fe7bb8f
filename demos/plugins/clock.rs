//! Clock - a minimal native Launchpad extension
//!
//! Writes its state file into the private data directory on start and logs
//! through the host.

use launchpad::extensions::{AppExtension, ExtensionContext, ExtensionMetadata, ExtensionType};
use std::fs;

#[derive(Default)]
pub struct Clock;

impl AppExtension for Clock {
    fn initialize(&mut self, context: &ExtensionContext) -> anyhow::Result<()> {
        fs::write(context.data_dir().join("state.txt"), "native")?;
        context.info("clock ready");
        Ok(())
    }
}

launchpad::export_extensions![
    // Helper rows are listed but never constructed
    ExtensionType::opaque("TimeFormatter"),
    ExtensionType::new::<Clock>().with_metadata(
        ExtensionMetadata::new("clock", "Clock", "1.0.0")
            .with_description("Shows the current time"),
    ),
];

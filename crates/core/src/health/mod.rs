pub mod log_scan;

pub use log_scan::{LogScanner, ScanSettings};

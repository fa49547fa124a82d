//! Example Reader (Attacher)
//!
//! Attaches to the channel created by the `writer` example and prints what
//! it reads without ever taking the semaphore.
//!
//! ```bash
//! cargo run --example reader -- venom_demo 256
//! ```

use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use venom_shm::{Channel, ChannelConfig, SemMode};

fn main() {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "venom_demo".to_string());
    let size: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(256);

    let config = match ChannelConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "bad configuration");
            std::process::exit(2);
        }
    };

    let sem_key = format!("{}_lock", name);
    let channel = match Channel::open_with_config(
        &name,
        size,
        true,
        &sem_key,
        SemMode::AttachExisting,
        &config,
    ) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to attach; make sure the writer is running first");
            std::process::exit(1);
        }
    };

    if let Some(reason) = channel.semaphore().and_then(|s| s.last_error()) {
        warn!(reason = %reason, "semaphore attached but not confirmed ready");
    }

    loop {
        match channel.read_all() {
            Ok(data) if data.len() >= 16 => {
                let mut counter = [0u8; 8];
                let mut stamp = [0u8; 8];
                counter.copy_from_slice(&data[..8]);
                stamp.copy_from_slice(&data[8..16]);
                let status = data.get(16).map(|b| b & 1 == 1);
                info!(
                    counter = u64::from_le_bytes(counter),
                    unix_time = u64::from_le_bytes(stamp),
                    ?status,
                    "snapshot"
                );
            }
            Ok(data) => info!(bytes = ?data, "snapshot"),
            Err(e) => warn!(error = %e, "read failed"),
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}

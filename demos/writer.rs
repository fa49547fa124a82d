//! Example Writer (Owner)
//!
//! Creates a double-buffered channel and publishes a counter plus a status
//! bit once per second until interrupted.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example writer -- venom_demo 256
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info};
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
    let channel =
        match Channel::open_with_config(&name, size, true, &sem_key, SemMode::CreateNew, &config) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to create channel");
                std::process::exit(1);
            }
        };

    info!(name = %name, size, "channel created, publishing once per second (Ctrl+C to quit)");

    let mut counter = 0u64;
    loop {
        counter += 1;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut record = [0u8; 16];
        record[..8].copy_from_slice(&counter.to_le_bytes());
        record[8..].copy_from_slice(&now.to_le_bytes());

        let len = record.len().min(size);
        if let Err(e) = channel.write_range(0, len, &record[..len]) {
            error!(error = %e, "write failed");
        }
        if size > 16 {
            if let Err(e) = channel.write_masked_byte(16, 0b0000_0001, counter % 2 == 0) {
                error!(error = %e, "status bit write failed");
            }
        }

        info!(counter, sequence = ?channel.sequence(), "published");
        std::thread::sleep(Duration::from_secs(1));
    }
}

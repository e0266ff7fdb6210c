//! Default producer configuration bootstrapping.

use std::io;
use std::path::Path;

/// File name the producer reads from its config directory.
pub const PRODUCER_CONFIG_FILE: &str = "config.yml";

/// Producer settings that route audio to stdout and expose the local
/// event API the relay subscribes to.
pub const DEFAULT_PRODUCER_CONFIG: &str = r#"device_name: "TigerTunes"
device_type: computer
bitrate: 320
zeroconf_enabled: true
credentials:
  type: interactive
audio_backend: pipe
audio_output_pipe: /dev/stdout
audio_output_pipe_format: s16le
server:
  enabled: true
  address: "0.0.0.0"
  port: 8888
  allow_origin: "*"
"#;

/// Write the default producer config into `dir` unless one already exists.
///
/// Returns `true` when a file was created.
pub fn ensure_producer_config(dir: &Path) -> io::Result<bool> {
    let path = dir.join(PRODUCER_CONFIG_FILE);
    if path.exists() {
        return Ok(false);
    }
    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, DEFAULT_PRODUCER_CONFIG)?;
    log::info!("[Pipeline] No producer config found, wrote default to {}", path.display());
    Ok(true)
}

//! Rendering of the `nats-server` configuration file.

use std::path::Path;

use crate::config::BrokerConfig;

/// File name of the generated server config inside the data directory.
pub const SERVER_CONFIG_FILE: &str = "nats-server.conf";

fn quoted(value: impl AsRef<str>) -> String {
    format!("{:?}", value.as_ref())
}

/// Render the server configuration with JetStream enabled and storing
/// under `store_dir`.
pub fn render_server_config(config: &BrokerConfig, store_dir: &Path) -> String {
    let mut lines = vec![
        format!("server_name: {}", quoted(&config.server_name)),
        format!("host: {}", quoted(&config.host)),
        format!("port: {}", config.port),
        String::new(),
        "jetstream {".to_string(),
        format!("  store_dir: {}", quoted(store_dir.to_string_lossy())),
        format!("  max_memory_store: {}", config.max_memory),
        format!("  max_file_store: {}", config.max_file_store),
    ];
    if !config.jetstream_domain.is_empty() {
        lines.push(format!("  domain: {}", quoted(&config.jetstream_domain)));
    }
    lines.push("}".to_string());

    if let Some(tls) = &config.tls {
        let cert_file = quoted(tls.cert_file.to_string_lossy());
        let key_file = quoted(tls.key_file.to_string_lossy());

        lines.push(String::new());
        lines.push("tls {".to_string());
        lines.push(format!("  cert_file: {}", cert_file));
        lines.push(format!("  key_file: {}", key_file));
        if let Some(ca) = &tls.ca_file {
            lines.push(format!("  ca_file: {}", quoted(ca.to_string_lossy())));
        }
        lines.push("}".to_string());

        if let Some(port) = config.websocket_port {
            lines.extend([
                String::new(),
                "websocket {".to_string(),
                format!("  port: {}", port),
                "  tls {".to_string(),
                format!("    cert_file: {}", cert_file),
                format!("    key_file: {}", key_file),
                "  }".to_string(),
                "}".to_string(),
            ]);
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

//! OpenTelemetry integration for bucket-sftp.
//!
//! Provides the OTel tracing layer and a sampler that keeps every
//! authentication span while thinning out the per-packet SFTP spans.
//!
//! Export is off unless the usual OTel variables ask for it, e.g.
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://collector:4317 OTEL_SERVICE_NAME=bucket-sftp bucket-sftp
//! ```
//!
//! `OTEL_SDK_DISABLED=true` turns export off regardless.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{otel_layer, OtelError, OtelGuard};

/// Whether the environment asks for span export: an OTLP endpoint or a
/// traces exporter other than `none`, and the SDK not disabled.
pub fn otel_enabled() -> bool {
    otel_enabled_from(|key| std::env::var(key).ok())
}

fn otel_enabled_from(var: impl Fn(&str) -> Option<String>) -> bool {
    if var("OTEL_SDK_DISABLED").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        return false;
    }

    if var("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() {
        return true;
    }

    if let Some(exporter) = var("OTEL_TRACES_EXPORTER") {
        return !exporter.eq_ignore_ascii_case("none");
    }

    false
}

/// Sampling rate for a span name.
///
/// | Prefix        | Rate | Rationale                                   |
/// |---------------|------|---------------------------------------------|
/// | `auth.*`      | 100% | Rare, and every rejection is worth keeping   |
/// | `session.*`   | 100% | One per SFTP channel                         |
/// | `sftp.read`   |  1%  | One span per READ packet, very high volume   |
/// | `sftp.write`  |  1%  | One span per WRITE packet, very high volume  |
/// | `sftp.*`      | 10%  | Metadata operations                          |
/// | `store.*`     | 10%  | Backend calls                                |
/// | other         | 10%  | Default for unclassified spans               |
pub fn sample_rate(name: &str) -> f64 {
    if name.starts_with("auth") || name.starts_with("session") {
        1.0
    } else if name.starts_with("sftp.read") || name.starts_with("sftp.write") {
        0.01
    } else {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_disabled_without_env() {
        assert!(!otel_enabled_from(env(&[])));
    }

    #[test]
    fn test_endpoint_enables() {
        assert!(otel_enabled_from(env(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4317")])));
    }

    #[test]
    fn test_sdk_disabled_wins() {
        assert!(!otel_enabled_from(env(&[
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4317"),
            ("OTEL_SDK_DISABLED", "TRUE"),
        ])));
    }

    #[test]
    fn test_exporter_none() {
        assert!(!otel_enabled_from(env(&[("OTEL_TRACES_EXPORTER", "none")])));
        assert!(otel_enabled_from(env(&[("OTEL_TRACES_EXPORTER", "otlp")])));
    }

    #[test]
    fn test_sample_rates() {
        assert_eq!(sample_rate("auth.password"), 1.0);
        assert_eq!(sample_rate("sftp.read"), 0.01);
        assert_eq!(sample_rate("sftp.opendir"), 0.1);
        assert_eq!(sample_rate("whatever"), 0.1);
    }
}

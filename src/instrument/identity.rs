//! Parsing of `*IDN?` replies.
//!
//! IEEE 488.2 instruments answer `manufacturer,model,serial,firmware`. Older or
//! cheaper units send fewer fields or a free-form string; those still parse,
//! with the missing fields left empty.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

#[allow(clippy::expect_used)]
static IDN_FIELDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([^,]*?)\s*(?:,\s*([^,]*?)\s*)?(?:,\s*([^,]*?)\s*)?(?:,\s*(.*?)\s*)?$")
        .expect("IDN pattern is valid")
});

/// Identification of a connected instrument.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Identity {
    /// First field, or the whole reply when it has no commas
    pub manufacturer: String,
    /// Second field
    pub model: String,
    /// Third field; `"0"` on instruments that do not report one
    pub serial: String,
    /// Fourth field and anything after it
    pub firmware: String,
    /// The reply as received
    pub raw: String,
}

impl Identity {
    /// Split a `*IDN?` reply into its fields.
    pub fn parse(reply: &str) -> Self {
        let raw = reply.trim().to_string();
        let field = |caps: &regex::Captures<'_>, i: usize| {
            caps.get(i)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        };
        match IDN_FIELDS.captures(&raw) {
            Some(caps) => Self {
                manufacturer: field(&caps, 1),
                model: field(&caps, 2),
                serial: field(&caps, 3),
                firmware: field(&caps, 4),
                raw: raw.clone(),
            },
            None => Self {
                raw,
                ..Self::default()
            },
        }
    }

    /// True if the raw reply starts with `prefix`.
    pub fn starts_with(&self, prefix: &str) -> bool {
        self.raw.starts_with(prefix)
    }

    /// True if the model field contains `model`. Free-form replies have no
    /// model field and are searched whole.
    pub fn is_model(&self, model: &str) -> bool {
        if self.model.is_empty() {
            self.raw.contains(model)
        } else {
            self.model.contains(model)
        }
    }

    /// `"manufacturer model"`, or the raw reply when it has no fields.
    pub fn label(&self) -> String {
        if self.model.is_empty() {
            self.raw.clone()
        } else {
            format!("{} {}", self.manufacturer, self.model)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_reply() {
        let id = Identity::parse("TEKTRONIX,TPS 2024,0,CF:91.1CT FV:v10.11\n");
        assert_eq!(id.manufacturer, "TEKTRONIX");
        assert_eq!(id.model, "TPS 2024");
        assert_eq!(id.serial, "0");
        assert_eq!(id.firmware, "CF:91.1CT FV:v10.11");
        assert!(id.starts_with("TEKTRONIX,TPS 20"));
    }

    #[test]
    fn test_parse_spaced_fields() {
        let id = Identity::parse("THURLBY THANDAR, CPX400DP, 466523, 1.00-1.00");
        assert_eq!(id.manufacturer, "THURLBY THANDAR");
        assert_eq!(id.model, "CPX400DP");
        assert_eq!(id.serial, "466523");
    }

    #[test]
    fn test_parse_free_form_reply() {
        let id = Identity::parse("KORADKD3005PV2.0");
        assert_eq!(id.manufacturer, "KORADKD3005PV2.0");
        assert_eq!(id.model, "");
        assert_eq!(id.raw, "KORADKD3005PV2.0");
        assert!(id.is_model("KD3005P"));
        assert_eq!(id.label(), "KORADKD3005PV2.0");
    }

    #[test]
    fn test_model_match_uses_model_field() {
        let id = Identity::parse("ACME,PSU-KD3005P-CLONE,1,2");
        assert!(id.is_model("KD3005P"));
        // A serial number that happens to contain the model is not a match
        let id = Identity::parse("ACME,X100,KD3005P,1.0");
        assert!(!id.is_model("KD3005P"));
        assert_eq!(id.label(), "ACME X100");
    }
}

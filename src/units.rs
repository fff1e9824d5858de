//! Engineering-notation formatting for labels such as `"Ch1 1.00V/div"`.
//!
//! Values are shown with three significant digits and an SI prefix chosen so
//! the mantissa lies in `1..1000`.

const PREFIXES: [(f64, &str); 7] = [
    (1e9, "G"),
    (1e6, "M"),
    (1e3, "k"),
    (1.0, ""),
    (1e-3, "m"),
    (1e-6, "u"),
    (1e-9, "n"),
];

/// Format `value` with an SI prefix and `unit`, e.g. `format_si(0.5, "V")` is
/// `"500mV"`.
pub fn format_si(value: f64, unit: &str) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{:.2}{}", value, unit);
    }
    let magnitude = value.abs();
    let (scale, prefix) = PREFIXES
        .iter()
        .copied()
        .find(|(scale, _)| magnitude >= *scale * 0.9995)
        .unwrap_or((1e-9, "n"));
    let mantissa = value / scale;
    let digits = match mantissa.abs() {
        m if m < 9.995 => 2,
        m if m < 99.95 => 1,
        _ => 0,
    };
    format!("{:.*}{}{}", digits, mantissa, prefix, unit)
}

/// Volts, e.g. `"1.00V"`.
pub fn volt_to_str(volts: f64) -> String {
    format_si(volts, "V")
}

/// Seconds, e.g. `"2.50us"`.
pub fn time_to_str(seconds: f64) -> String {
    format_si(seconds, "s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volt_labels() {
        assert_eq!(volt_to_str(1.0), "1.00V");
        assert_eq!(volt_to_str(0.5), "500mV");
        assert_eq!(volt_to_str(0.025), "25.0mV");
        assert_eq!(volt_to_str(-2.0), "-2.00V");
        assert_eq!(volt_to_str(0.0), "0.00V");
        assert_eq!(volt_to_str(1500.0), "1.50kV");
    }

    #[test]
    fn test_time_labels() {
        assert_eq!(time_to_str(2.5e-6), "2.50us");
        assert_eq!(time_to_str(1e-9), "1.00ns");
        assert_eq!(time_to_str(0.1), "100ms");
    }

    #[test]
    fn test_rounding_at_prefix_boundary() {
        // 0.9999 rounds to 1.00, not "1000mV"
        assert_eq!(volt_to_str(0.9999), "1.00V");
    }
}

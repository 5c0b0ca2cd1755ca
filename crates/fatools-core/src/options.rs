use serde_json::{Number, Value};

use crate::{AssayOptions, FatoolsError, Result};

/// Splits an option string such as `ploidy=2,dilution=0.5,note=rerun` into a map.
///
/// Tokens are separated by commas. Values that parse as integers or finite
/// floats become JSON numbers; anything else is kept as a string. Empty
/// tokens are ignored.
pub fn tokenize(text: &str) -> Result<AssayOptions> {
    let mut options = AssayOptions::new();
    for token in text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| FatoolsError::InvalidOption(token.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(FatoolsError::InvalidOption(token.to_string()));
        }
        options.insert(key.to_string(), convert(value.trim()));
    }
    Ok(options)
}

fn convert(value: &str) -> Value {
    if let Ok(i) = value.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Some(n) = value.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(value.to_string())
}

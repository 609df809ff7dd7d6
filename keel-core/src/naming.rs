//! Resource naming rules
//!
//! Names start with a lowercase letter, contain only lowercase ASCII
//! letters and digits (plus `-` where the kind allows it) and are at most
//! 20 characters long.

use crate::error::{ControlError, Result};

/// Maximum length of a resource name
pub const MAX_NAME_LEN: usize = 20;

/// Validates a resource name
///
/// # Arguments
/// * `name` - The candidate name
/// * `allow_dash` - Whether `-` is accepted after the first character
pub fn validate_name(name: &str, allow_dash: bool) -> Result<()> {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return Err(ControlError::Validation("name cannot be empty".to_string()));
    };

    if name.len() > MAX_NAME_LEN {
        return Err(ControlError::Validation(format!(
            "name '{}' is longer than {} characters",
            name, MAX_NAME_LEN
        )));
    }

    if !first.is_ascii_lowercase() {
        return Err(ControlError::Validation(format!(
            "name '{}' must start with a lowercase letter",
            name
        )));
    }

    for c in chars {
        let ok = c.is_ascii_lowercase() || c.is_ascii_digit() || (allow_dash && c == '-');
        if !ok {
            return Err(ControlError::Validation(format!(
                "name '{}' contains invalid character '{}'",
                name, c
            )));
        }
    }

    Ok(())
}

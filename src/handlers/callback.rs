use thiserror::Error;

use crate::handlers::responses::{ActionButton, ActionGrid};
use crate::imagegen::VariantSlot;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("malformed callback payload {0:?}")]
    Malformed(String),
    #[error("unknown action code {0:?}")]
    UnknownAction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageAction {
    Upscale(VariantSlot),
    Variant(VariantSlot),
}

impl ImageAction {
    pub fn code(self) -> String {
        match self {
            ImageAction::Upscale(slot) => format!("U{slot}"),
            ImageAction::Variant(slot) => format!("V{slot}"),
        }
    }

    fn parse(code: &str) -> Result<Self, CallbackError> {
        let mut chars = code.chars();
        let (Some(letter), Some(digit), None) = (chars.next(), chars.next(), chars.next()) else {
            return Err(CallbackError::UnknownAction(code.to_string()));
        };
        let slot = digit
            .to_digit(10)
            .and_then(|value| VariantSlot::new(value as u8))
            .ok_or_else(|| CallbackError::UnknownAction(code.to_string()))?;
        match letter {
            'U' => Ok(ImageAction::Upscale(slot)),
            'V' => Ok(ImageAction::Variant(slot)),
            _ => Err(CallbackError::UnknownAction(code.to_string())),
        }
    }
}

/// Button payload `{image_id}:{code}`, decoded once when the press arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackToken {
    pub image_id: String,
    pub action: ImageAction,
}

impl CallbackToken {
    pub fn new(image_id: &str, action: ImageAction) -> Self {
        CallbackToken {
            image_id: image_id.to_string(),
            action,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.image_id, self.action.code())
    }

    pub fn parse(data: &str) -> Result<Self, CallbackError> {
        let Some((image_id, code)) = data.split_once(':') else {
            return Err(CallbackError::Malformed(data.to_string()));
        };
        if image_id.trim().is_empty() || code.is_empty() || code.contains(':') {
            return Err(CallbackError::Malformed(data.to_string()));
        }
        Ok(CallbackToken {
            image_id: image_id.to_string(),
            action: ImageAction::parse(code)?,
        })
    }
}

/// Upscale row over variation row, one button per slot.
pub fn action_grid(image_id: &str) -> ActionGrid {
    let row = |make: fn(VariantSlot) -> ImageAction| {
        VariantSlot::ALL
            .iter()
            .map(|slot| {
                let action = make(*slot);
                ActionButton {
                    label: action.code(),
                    token: CallbackToken::new(image_id, action).encode(),
                }
            })
            .collect::<Vec<_>>()
    };
    ActionGrid {
        rows: vec![row(ImageAction::Upscale), row(ImageAction::Variant)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(index: u8) -> VariantSlot {
        VariantSlot::new(index).unwrap()
    }

    #[test]
    fn parses_upscale_and_variant_tokens() {
        assert_eq!(
            CallbackToken::parse("1122334455:U2"),
            Ok(CallbackToken::new("1122334455", ImageAction::Upscale(slot(2))))
        );
        assert_eq!(
            CallbackToken::parse("1122334455:V4"),
            Ok(CallbackToken::new("1122334455", ImageAction::Variant(slot(4))))
        );
    }

    #[test]
    fn rejects_payloads_without_separator_or_id() {
        for data in ["", "1122", ":U1", "1122:", "a:b:U1"] {
            assert_eq!(
                CallbackToken::parse(data),
                Err(CallbackError::Malformed(data.to_string())),
                "{data}"
            );
        }
    }

    #[test]
    fn unknown_letters_and_slots_are_unknown_actions() {
        for code in ["X1", "U5", "V0", "U", "U12", "u1"] {
            let data = format!("99:{code}");
            assert_eq!(
                CallbackToken::parse(&data),
                Err(CallbackError::UnknownAction(code.to_string())),
                "{code}"
            );
        }
    }

    #[test]
    fn grid_has_eight_buttons_in_two_rows() {
        let grid = action_grid("77");
        assert_eq!(grid.rows.len(), 2);
        let tokens = grid.tokens();
        assert_eq!(
            tokens,
            vec!["77:U1", "77:U2", "77:U3", "77:U4", "77:V1", "77:V2", "77:V3", "77:V4"]
        );
        assert_eq!(grid.rows[1][2].label, "V3");
        for token in tokens {
            assert_eq!(CallbackToken::parse(&token).map(|t| t.image_id), Ok("77".to_string()));
        }
    }
}

//! Stream label grammar.
//!
//! A client-opened stream says what it wants through its label:
//!
//! - `%` is the command & control stream
//! - `echo,hello world` runs a command with no terminal size
//! - `24x80,bash` runs a command on a 24 rows by 80 cols terminal
//! - `>12` (optionally `24x80,>12`) reconnects to pane 12

use crate::error::{PmuxError, PmuxResult};
use crate::messages::{Dimensions, CONTROL_LABEL};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLabel {
    Control,
    NewPane {
        dimensions: Option<Dimensions>,
        command: Vec<String>,
    },
    Reconnect {
        pane_id: u64,
    },
}

impl FromStr for StreamLabel {
    type Err = PmuxError;

    fn from_str(label: &str) -> PmuxResult<Self> {
        if label.starts_with(CONTROL_LABEL) {
            return Ok(Self::Control);
        }
        let first = label
            .chars()
            .next()
            .ok_or_else(|| PmuxError::InvalidLabel("empty label".into()))?;

        let fields: Vec<&str> = label.split(',').collect();
        let (dimensions, rest) = if first.is_ascii_digit() {
            let dimensions = fields[0].parse::<Dimensions>()?;
            if fields.len() < 2 {
                return Err(PmuxError::InvalidLabel(format!("no command in {label:?}")));
            }
            (Some(dimensions), &fields[1..])
        } else {
            (None, &fields[..])
        };

        if let Some(id) = rest[0].strip_prefix('>') {
            let pane_id = id
                .parse::<u64>()
                .map_err(|e| PmuxError::InvalidLabel(format!("bad pane id in {label:?}: {e}")))?;
            return Ok(Self::Reconnect { pane_id });
        }
        if rest[0].trim().is_empty() {
            return Err(PmuxError::InvalidLabel(format!("empty command in {label:?}")));
        }
        Ok(Self::NewPane {
            dimensions,
            command: rest.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control() {
        assert_eq!("%".parse::<StreamLabel>().unwrap(), StreamLabel::Control);
    }

    #[test]
    fn unsized_command() {
        assert_eq!(
            "echo,hello world".parse::<StreamLabel>().unwrap(),
            StreamLabel::NewPane {
                dimensions: None,
                command: vec!["echo".into(), "hello world".into()],
            }
        );
    }

    #[test]
    fn sized_command() {
        assert_eq!(
            "24x80,bash".parse::<StreamLabel>().unwrap(),
            StreamLabel::NewPane {
                dimensions: Some(Dimensions::new(24, 80)),
                command: vec!["bash".into()],
            }
        );
    }

    #[test]
    fn reconnect() {
        assert_eq!(
            ">12".parse::<StreamLabel>().unwrap(),
            StreamLabel::Reconnect { pane_id: 12 }
        );
        assert_eq!(
            "24x80,>5".parse::<StreamLabel>().unwrap(),
            StreamLabel::Reconnect { pane_id: 5 }
        );
    }

    #[test]
    fn malformed() {
        for label in ["", "24x80", "24x80,", "2x,bash", ">", ">abc", ",ls"] {
            assert!(
                label.parse::<StreamLabel>().is_err(),
                "{label:?} should be rejected"
            );
        }
    }
}

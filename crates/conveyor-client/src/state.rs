// ── Client connection state ──

use serde::Serialize;
use strum::{Display, EnumString, IntoStaticStr};

/// Lifecycle marker owned by every client.
///
/// `Closed → Pending` when a connect attempt starts, then `Open` on success
/// or back to `Closed` on failure.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectState {
    #[default]
    Closed,
    Pending,
    Open,
}

impl ConnectState {
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectState;

    #[test]
    fn displays_upper_case() {
        assert_eq!(ConnectState::Pending.to_string(), "PENDING");
        assert_eq!("open".parse::<ConnectState>().ok(), Some(ConnectState::Open));
    }

    #[test]
    fn default_is_closed() {
        assert_eq!(ConnectState::default(), ConnectState::Closed);
        assert!(!ConnectState::default().is_open());
    }
}

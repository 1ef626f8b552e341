//! LivenessProbe port - Lock 保持者がまだ生きているかの判定

use crate::domain::HolderId;

pub trait LivenessProbe: Send + Sync {
    /// False only when the holder is known to be gone. Unknown counts as alive.
    fn is_alive(&self, holder: &HolderId) -> bool;
}

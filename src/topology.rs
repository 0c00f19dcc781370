//! Cluster topology state owned by the management service.
//!
//! Only the part consensus writes to lives here: the highest volume id ever
//! handed out. Volume placement is handled elsewhere.

use tokio::sync::watch;

pub type VolumeId = u32;

#[derive(Debug)]
pub struct Topology {
    max_volume_id: watch::Sender<VolumeId>,
    volume_size_limit_mb: u64,
    default_replication: String,
}

impl Topology {
    pub fn new(volume_size_limit_mb: u64, default_replication: impl Into<String>) -> Self {
        let (max_volume_id, _) = watch::channel(0);
        Self {
            max_volume_id,
            volume_size_limit_mb,
            default_replication: default_replication.into(),
        }
    }

    pub fn max_volume_id(&self) -> VolumeId {
        *self.max_volume_id.borrow()
    }

    pub fn next_volume_id(&self) -> VolumeId {
        self.max_volume_id().saturating_add(1)
    }

    /// Raise the max volume id. Lower values are ignored so that replaying
    /// the log is harmless. Returns true if the value changed.
    pub fn up_adjust_max_volume_id(&self, volume_id: VolumeId) -> bool {
        self.max_volume_id.send_if_modified(|current| {
            if volume_id > *current {
                *current = volume_id;
                true
            } else {
                false
            }
        })
    }

    /// Watch max volume id changes.
    pub fn subscribe(&self) -> watch::Receiver<VolumeId> {
        self.max_volume_id.subscribe()
    }

    pub fn volume_size_limit_mb(&self) -> u64 {
        self.volume_size_limit_mb
    }

    pub fn default_replication(&self) -> &str {
        &self.default_replication
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_volume_id_only_moves_up() {
        let topo = Topology::new(30_000, "000");
        assert_eq!(topo.max_volume_id(), 0);
        assert_eq!(topo.next_volume_id(), 1);

        assert!(topo.up_adjust_max_volume_id(5));
        assert!(!topo.up_adjust_max_volume_id(3));
        assert!(!topo.up_adjust_max_volume_id(5));
        assert_eq!(topo.max_volume_id(), 5);
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let topo = Topology::new(30_000, "000");
        let mut rx = topo.subscribe();

        topo.up_adjust_max_volume_id(7);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 7);
    }
}

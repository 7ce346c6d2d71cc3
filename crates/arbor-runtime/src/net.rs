//! Traffic-class bookkeeping per container.
//!
//! The daemon tags container traffic through the `net_cls` controller and
//! keeps the per-interface priority/limit tables that the TC layer consumes.
//! Qdisc programming itself lives outside the container engine.

use std::collections::BTreeMap;

use arbor_common::{Error, ErrorKind, Result};

/// Default priority assigned to the `default` traffic class.
const NET_DEFAULT_PRIO: u64 = 3;

/// Traffic-class configuration of one container.
#[derive(Debug, Clone)]
pub struct NetClass {
    /// classid written to `net_cls.classid`, derived from the container id.
    pub classid: u32,
    /// Per-interface priority map.
    pub prio: BTreeMap<String, u64>,
    /// Per-interface tx limit, bytes per second.
    pub limit: BTreeMap<String, u64>,
    /// Per-interface tx guarantee, bytes per second.
    pub guarantee: BTreeMap<String, u64>,
    /// Per-interface rx limit, bytes per second.
    pub rx_limit: BTreeMap<String, u64>,
    /// Whether the class has been materialized since the last start.
    pub registered: bool,
}

impl NetClass {
    /// Fresh class table for a container id.
    #[must_use]
    pub fn new(id: u32) -> Self {
        let mut prio = BTreeMap::new();
        prio.insert(String::from("default"), NET_DEFAULT_PRIO);
        Self {
            // Major 1 is the daemon's qdisc handle; minors follow ids.
            classid: (1 << 16) | id,
            prio,
            limit: BTreeMap::new(),
            guarantee: BTreeMap::new(),
            rx_limit: BTreeMap::new(),
            registered: false,
        }
    }

    /// Validates and installs the class tables with the TC layer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` when a priority is out of the 0..=7 band.
    pub fn setup(&mut self) -> Result<()> {
        for (iface, &prio) in &self.prio {
            if prio > 7 {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("net priority {prio} out of range for {iface}"),
                ));
            }
        }
        tracing::debug!(
            classid = format_args!("{:x}", self.classid),
            prio = ?self.prio,
            limit = ?self.limit,
            guarantee = ?self.guarantee,
            rx_limit = ?self.rx_limit,
            "traffic classes configured"
        );
        self.registered = true;
        Ok(())
    }

    /// Drops the class registration at stop or teardown.
    pub fn teardown(&mut self) {
        if self.registered {
            tracing::debug!(classid = format_args!("{:x}", self.classid), "traffic classes released");
            self.registered = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classid_embeds_container_id() {
        let class = NetClass::new(42);
        assert_eq!(class.classid & 0xffff, 42);
        assert_eq!(class.classid >> 16, 1);
    }

    #[test]
    fn setup_registers_and_validates() {
        let mut class = NetClass::new(1);
        class.setup().expect("default tables are valid");
        assert!(class.registered);

        class.prio.insert("eth0".into(), 9);
        assert!(class.setup().is_err());
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut class = NetClass::new(1);
        class.setup().expect("setup");
        class.teardown();
        class.teardown();
        assert!(!class.registered);
    }
}

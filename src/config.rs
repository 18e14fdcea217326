use std::time::Duration;

use anyhow::bail;

use crate::messaging::group_router::TransportGroupId;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// capacity per transport group. The transport's maximum number of connections must cover
    ///  their sum.
    pub transport_groups: Vec<(TransportGroupId, usize)>,
    /// the group whose connections receive object messages addressed to 'others'
    pub object_message_group: TransportGroupId,

    pub nat_punch_attempt_timeout: Duration,
    pub nat_punch_cleanup_interval: Duration,
    pub connection_attempt_timeout: Duration,

    pub tick_interval: Duration,

    /// frames are packed into packets up to this size, larger frames are dropped
    pub max_packet_size: usize,

    pub buffer_size: usize,
    pub max_pooled_buffers: usize,

    pub initial_object_capacity: usize,
    pub object_id_growth: usize,
    /// objects with higher ids are refused, including ids announced by peers
    pub max_object_id: u32,
}

impl NetworkConfig {
    pub fn new() -> NetworkConfig {
        NetworkConfig {
            transport_groups: vec![(TransportGroupId::DEFAULT, 64)],
            object_message_group: TransportGroupId::DEFAULT,
            nat_punch_attempt_timeout: Duration::from_secs(30),
            nat_punch_cleanup_interval: Duration::from_secs(1),
            connection_attempt_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(16),
            max_packet_size: 1472,
            buffer_size: 1472,
            max_pooled_buffers: 256,
            initial_object_capacity: 256,
            object_id_growth: 256,
            max_object_id: u16::MAX as u32,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.transport_groups.iter()
            .map(|(_, capacity)| capacity)
            .sum()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transport_groups.is_empty() {
            bail!("at least one transport group is required");
        }
        for (idx, (group, _)) in self.transport_groups.iter().enumerate() {
            if self.transport_groups[..idx].iter().any(|(g, _)| g == group) {
                bail!("transport group {:?} is configured more than once", group);
            }
        }
        if !self.transport_groups.iter().any(|(g, _)| *g == TransportGroupId::DEFAULT) {
            bail!("the default transport group must be configured - new connections are assigned to it");
        }
        if !self.transport_groups.iter().any(|(g, _)| *g == self.object_message_group) {
            bail!("object message group {:?} is not a configured transport group", self.object_message_group);
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.nat_punch_cleanup_interval.is_zero() {
            bail!("NAT punch cleanup interval must be positive");
        }
        // frame length prefix and type id must fit next to at least some payload
        if self.max_packet_size < 16 {
            bail!("max packet size {} is too small", self.max_packet_size);
        }
        if self.object_id_growth == 0 {
            bail!("object id growth must be positive");
        }
        if self.initial_object_capacity > self.max_object_id as usize + 1 {
            bail!("initial object capacity {} exceeds the maximum object id {}", self.initial_object_capacity, self.max_object_id);
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig::new()
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig::new();
        config.validate().unwrap();
        assert_eq!(config.max_connections(), 64);
        assert_eq!(config.nat_punch_attempt_timeout, Duration::from_secs(30));
        assert_eq!(config.connection_attempt_timeout, Duration::from_secs(10));
        assert_eq!(config.object_id_growth, 256);
        assert_eq!(config.max_object_id, 65535);
    }

    #[rstest]
    #[case::no_groups(|c: &mut NetworkConfig| c.transport_groups.clear())]
    #[case::duplicate_group(|c: &mut NetworkConfig| c.transport_groups.push((TransportGroupId::DEFAULT, 4)))]
    #[case::no_default_group(|c: &mut NetworkConfig| c.transport_groups = vec![(TransportGroupId(1), 4)])]
    #[case::unknown_object_group(|c: &mut NetworkConfig| c.object_message_group = TransportGroupId(2))]
    #[case::zero_tick(|c: &mut NetworkConfig| c.tick_interval = Duration::ZERO)]
    #[case::zero_cleanup(|c: &mut NetworkConfig| c.nat_punch_cleanup_interval = Duration::ZERO)]
    #[case::tiny_packets(|c: &mut NetworkConfig| c.max_packet_size = 8)]
    #[case::zero_growth(|c: &mut NetworkConfig| c.object_id_growth = 0)]
    #[case::capacity_beyond_max_id(|c: &mut NetworkConfig| c.max_object_id = 100)]
    fn test_invalid(#[case] modify: fn(&mut NetworkConfig)) {
        let mut config = NetworkConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multiple_groups() {
        let mut config = NetworkConfig::new();
        config.transport_groups.push((TransportGroupId(2), 16));
        config.object_message_group = TransportGroupId(2);
        config.validate().unwrap();
        assert_eq!(config.max_connections(), 80);
    }
}

//! Resources - Managed cloud objects, one handler per type

mod compute_instance;
mod kafka_instance;
mod rds_instance;
mod security_group;
mod security_group_rule;
pub(crate) mod vpc;
mod vpc_subnet;

pub use compute_instance::ComputeInstanceHandler;
pub use kafka_instance::KafkaInstanceHandler;
pub use rds_instance::RdsInstanceHandler;
pub use security_group::SecurityGroupHandler;
pub use security_group_rule::SecurityGroupRuleHandler;
pub use vpc::VpcHandler;
pub use vpc_subnet::SubnetHandler;

use crate::handler::ResourceHandler;

/// Every resource type this provider manages
pub fn all() -> Vec<Box<dyn ResourceHandler>> {
    vec![
        Box::new(VpcHandler),
        Box::new(SubnetHandler),
        Box::new(SecurityGroupHandler),
        Box::new(SecurityGroupRuleHandler),
        Box::new(ComputeInstanceHandler),
        Box::new(RdsInstanceHandler),
        Box::new(KafkaInstanceHandler),
    ]
}

//! Data sources - Read-only lookups of existing cloud objects

mod availability_zones;
mod vpc;

pub use availability_zones::AvailabilityZones;
pub use vpc::VpcLookup;

use crate::handler::DataSourceHandler;

/// Every data source this provider serves
pub fn all() -> Vec<Box<dyn DataSourceHandler>> {
    vec![Box::new(VpcLookup), Box::new(AvailabilityZones)]
}

//! Pricing table and cost computation.
//!
//! The provider's price book is slow to fetch and rate-limited, so the
//! driver memoizes the digested [`PricingData`] through the resource cache.

use crate::api::PriceEntry;
use crate::error::{HyperstackError, Result};
use cirrus_cloud::hyperstack::{HyperstackConfiguration, Region};
use cirrus_cloud::{CloudError, State};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Every server carries a fixed-size boot volume; only the data volume size
/// is user-configurable.
pub const BOOT_DISK_SIZE_GB: u32 = 50;

/// Price book row name for block storage.
const VOLUME_PRICE_NAME: &str = "Cloud-SSD";

/// Digested price book: what one flavor-hour and one volume GB-hour cost.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingData {
    /// `{region}/{flavor}` -> dollars per hour.
    pub flavor_cost_per_hour: HashMap<String, f64>,
    /// Dollars per GB-hour of provisioned block storage.
    pub volume_cost_per_gb_hour: f64,
}

impl PricingData {
    pub fn from_pricebook(entries: &[PriceEntry]) -> Self {
        let mut pricing = PricingData::default();
        for entry in entries {
            let Ok(value) = entry.value.parse::<f64>() else {
                tracing::warn!(name = %entry.name, value = %entry.value, "unparsable price");
                continue;
            };
            if entry.name == VOLUME_PRICE_NAME {
                pricing.volume_cost_per_gb_hour = value;
            } else if let Some(region) = &entry.region_name {
                pricing
                    .flavor_cost_per_hour
                    .insert(flavor_key(region, &entry.name), value);
            }
        }
        pricing
    }

    pub fn flavor_cost(&self, region: Region, flavor: &str) -> Option<f64> {
        self.flavor_cost_per_hour
            .get(&flavor_key(&region.to_string(), flavor))
            .copied()
    }
}

fn flavor_key(region: &str, flavor: &str) -> String {
    format!("{region}/{flavor}")
}

/// Dollars per hour of a server sitting in `state`.
///
/// Storage is billed whether or not the VM runs; the flavor only while it
/// does. Only stable, provisioned states have a defined cost -- callers
/// resolve transient states to their target first, and `deprovisioned` is
/// handled by the driver before pricing data is even fetched.
pub fn compute_cost(
    pricing: &PricingData,
    configuration: &HyperstackConfiguration,
    state: State,
) -> Result<f64> {
    let storage_gb = BOOT_DISK_SIZE_GB + configuration.disk_size_gb;
    let storage = f64::from(storage_gb) * pricing.volume_cost_per_gb_hour;
    match state {
        State::Off => Ok(storage),
        State::Running => {
            let flavor = pricing
                .flavor_cost(configuration.region_name, &configuration.flavor_name)
                .ok_or_else(|| HyperstackError::MissingPrice {
                    flavor: configuration.flavor_name.clone(),
                    region: configuration.region_name,
                })?;
            Ok(flavor + storage)
        }
        other => Err(CloudError::CostUndefined(other).into()),
    }
}

//! EC2 implementation of the cloud fleet client.
//!
//! Fleets are discovered by the tag set the infrastructure layer applies
//! (`cluster`, `sector`, `size`), restricted to states that can serve
//! capacity. The manager is the sole writer of target capacity.

use async_trait::async_trait;
use aws_sdk_ec2::types::{Filter, TargetCapacitySpecificationRequest};
use tracing::debug;

use super::{ClientError, FleetApi, FleetObservation, FleetSelector};

/// Fleet states that can currently hold or change capacity.
const SERVABLE_FLEET_STATES: [&str; 3] = ["submitted", "active", "modifying"];

/// Cloud fleet client backed by the EC2 API.
pub struct Ec2FleetApi {
    client: aws_sdk_ec2::Client,
}

impl Ec2FleetApi {
    /// Connects using the ambient AWS environment (instance profile,
    /// credentials file, or environment variables).
    pub async fn connect() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: aws_sdk_ec2::Client::new(&config),
        }
    }

    /// Wraps an existing EC2 client.
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FleetApi for Ec2FleetApi {
    async fn describe_fleet(
        &self,
        selector: &FleetSelector,
    ) -> Result<FleetObservation, ClientError> {
        let state_filter = {
            let mut builder = Filter::builder().name("fleet-state");
            for state in SERVABLE_FLEET_STATES {
                builder = builder.values(state);
            }
            builder.build()
        };

        let response = self
            .client
            .describe_fleets()
            .filters(state_filter)
            .filters(tag_filter("cluster", &selector.cluster))
            .filters(tag_filter("sector", &selector.sector))
            .filters(tag_filter("size", selector.size.as_str()))
            .send()
            .await
            .map_err(|e| ClientError::Cloud(e.to_string()))?;

        let fleet = response
            .fleets()
            .first()
            .ok_or_else(|| ClientError::FleetNotFound(selector.to_string()))?;
        let fleet_id = fleet
            .fleet_id()
            .ok_or_else(|| ClientError::FleetNotFound(selector.to_string()))?
            .to_string();
        let target_capacity = fleet
            .target_capacity_specification()
            .and_then(|spec| spec.total_target_capacity())
            .unwrap_or(0)
            .max(0) as u32;

        let instances = self
            .client
            .describe_fleet_instances()
            .fleet_id(&fleet_id)
            .send()
            .await
            .map_err(|e| ClientError::Cloud(e.to_string()))?;
        let instance_ids: Vec<String> = instances
            .active_instances()
            .iter()
            .filter_map(|instance| instance.instance_id().map(str::to_string))
            .collect();

        debug!(
            fleet_id = %fleet_id,
            target_capacity,
            instance_count = instance_ids.len(),
            "Described fleet"
        );

        Ok(FleetObservation {
            fleet_id,
            target_capacity,
            instance_ids,
        })
    }

    async fn modify_target_capacity(
        &self,
        fleet_id: &str,
        target_capacity: u32,
    ) -> Result<(), ClientError> {
        let spec = TargetCapacitySpecificationRequest::builder()
            .total_target_capacity(target_capacity as i32)
            .build();

        let response = self
            .client
            .modify_fleet()
            .fleet_id(fleet_id)
            .target_capacity_specification(spec)
            .send()
            .await
            .map_err(|e| ClientError::Cloud(e.to_string()))?;

        if !response.r#return().unwrap_or(false) {
            return Err(ClientError::Cloud(format!(
                "modify_fleet was not accepted for {fleet_id}"
            )));
        }

        debug!(fleet_id, target_capacity, "Modified fleet target capacity");
        Ok(())
    }
}

fn tag_filter(key: &str, value: &str) -> Filter {
    Filter::builder()
        .name(format!("tag:{key}"))
        .values(value)
        .build()
}

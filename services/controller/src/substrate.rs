//! Worker unit lifecycle primitive.

use async_trait::async_trait;
use trainjob_api::{UnitStatus, WorkerUnitSpec};
use trainjob_id::UnitId;

use crate::error::SubstrateError;

/// The orchestration substrate that actually runs worker units.
///
/// Unit names are unique per substrate: a second create under an existing
/// name fails with [`SubstrateError::AlreadyExists`].
#[async_trait]
pub trait Substrate: Send + Sync {
    async fn create_worker_unit(&self, spec: &WorkerUnitSpec) -> Result<UnitId, SubstrateError>;

    async fn delete_worker_unit(&self, id: &UnitId) -> Result<(), SubstrateError>;

    async fn get_worker_unit_status(&self, id: &UnitId) -> Result<UnitStatus, SubstrateError>;
}

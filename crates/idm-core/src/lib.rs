//! # idm-core
//!
//! Identifier types shared by every crate of the idm provisioning engine.
//!
//! Each entity of the provisioning domain (systems, accounts, operations,
//! batches, mappings...) gets its own UUID newtype so that an operation id
//! can never be passed where a batch id is expected.

pub mod ids;

pub use ids::{
    AccountId, ArchiveId, BatchId, BreakConfigId, EntityId, MappingId, OperationId,
    ParseIdError, RoleId, SchemaAttributeId, SystemEntityId, SystemId, SystemMappingId,
};

//! # Connector vocabulary
//!
//! Types shared between the provisioning engine and the connectors that talk
//! to target systems:
//!
//! - [`AttributeValue`] - single, multi-valued, guarded or confidential values
//! - [`ConnectorObject`] - the connector-level object sent to a target
//! - [`SchemaAttribute`] - a target schema attribute with its capabilities
//! - [`ConnectorDispatcher`] - the seam through which operations reach a target
//! - [`ConnectorError`] - failures reported by connectors, classified transient or permanent

pub mod dispatch;
pub mod error;
pub mod object;
pub mod schema;
pub mod types;
pub mod value;

pub use dispatch::{ConnectorDispatcher, DispatchOutcome, DispatchRequest};
pub use error::{ConnectorError, ConnectorResult};
pub use object::{ConnectorAttribute, ConnectorObject};
pub use schema::{SchemaAttribute, NAME_ATTRIBUTE, PASSWORD_ATTRIBUTE};
pub use types::{OperationType, ParseOperationTypeError};
pub use value::{AttributeValue, ConfidentialReference};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::dispatch::{ConnectorDispatcher, DispatchOutcome, DispatchRequest};
    pub use crate::error::{ConnectorError, ConnectorResult};
    pub use crate::object::{ConnectorAttribute, ConnectorObject};
    pub use crate::schema::SchemaAttribute;
    pub use crate::types::OperationType;
    pub use crate::value::{AttributeValue, ConfidentialReference};
}

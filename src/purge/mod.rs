//! Erasure stages: relational purge and external API erasure.

pub mod external;
pub mod http;
mod procedure;
pub mod relational;

pub use external::{
    BatchDelivery, BatchRequest, BatchStatus, DeliveryOutcome, ErasureApi, ExternalEraser,
    ExternalOutcome, IdentifierOutcome,
};
pub use http::{HttpApiError, HttpErasureApi};
pub use procedure::{DeletionProcedure, ProcedureError};
pub use relational::{RelationalError, RelationalOutcome, RelationalStatus, purge_relational};

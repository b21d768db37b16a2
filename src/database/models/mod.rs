// Database models - Re-exports all domain-specific models
//
// - dog.rs: identity records and upsert outcomes

mod dog;

pub use dog::{IdentityRecord, PriorSighting, UpsertOutcome};

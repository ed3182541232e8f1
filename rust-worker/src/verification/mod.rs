//! Social-group eligibility verification.

pub mod client;
pub mod workflow;

pub use client::{
    CheckResponse, CheckStatus, GroupCheckResult, HttpVerificationClient, VerificationError,
    VerificationService,
};
pub use workflow::{
    reconcile, verification_expiry, CheckOutcome, SocialGroupVerifier, Verdict,
    VerificationReport, WorkflowError,
};

//! Voice-to-invoice pipeline for UK trades.
//!
//! Turns a spoken job description into a tax-correct draft invoice:
//! microphone capture → speech-to-text → transcript cleaning → field
//! extraction → CIS/VAT resolution → persistence. CIS deductions apply to
//! pre-VAT labour only; VAT applies to the full subtotal; amounts are rounded
//! to two decimal places at display time only.
//!
//! The entry point is [`pipeline::SharedPipeline`]: construct it with an STT
//! provider, an LLM provider, a plan-access implementation and the stores,
//! then drive it with `start_recording` / `stop_and_create_invoice`.

pub mod audio_capture;
pub mod customers;
pub mod draft;
pub mod entitlements;
pub mod extract;
pub mod invoices;
pub mod llm;
pub mod normalize;
pub mod pipeline;
pub mod session;
pub mod stt;
pub mod tax;

#[cfg(test)]
mod tests;

pub use draft::{InvoiceDraft, MaterialItem, TriState};
pub use pipeline::{CreatedInvoice, PipelineConfig, PipelineError, PipelineState, SharedPipeline};
pub use tax::TaxCalculation;

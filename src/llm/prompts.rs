//! System prompts and schemas for the cleaning and extraction stages.

use super::JsonSchemaSpec;
use serde_json::json;

/// The four canonical tax statements the normalizer must emit.
///
/// Downstream tri-state detection matches these sentences exactly, so the
/// wording here and in `normalize::canonicalize_tax_statements` must agree.
pub const CANONICAL_CIS_YES: &str = "This is a CIS job.";
pub const CANONICAL_CIS_NO: &str = "This is not a CIS job.";
pub const CANONICAL_VAT_YES: &str = "VAT is charged.";
pub const CANONICAL_VAT_NO: &str = "No VAT is charged.";

/// System prompt for the transcript cleaning stage.
pub const CLEANING_PROMPT: &str = r#"You clean up speech-to-text transcripts of UK tradespeople describing a job they want to invoice.

Rules, in priority order:
1. PRESERVE VERBATIM: person names, company names, street names, addresses, postcodes, money amounts, and hour counts. Losing any of these is unrecoverable. When in doubt, keep the original token.
2. Normalise regional dialect and slang to standard English without changing meaning (e.g. "three bags of sand and cement" stays factual; "sorted the gaff" becomes "fixed the property").
3. Remove filler words and false starts. Remove tokens that are clearly transcription noise (not words, numbers, currency, names, or addresses) only when you are confident; keep anything ambiguous.
4. If the speaker states whether the job falls under the Construction Industry Scheme, express it as exactly one of these sentences: "This is a CIS job." or "This is not a CIS job."
5. If the speaker states whether VAT applies, express it as exactly one of: "VAT is charged." or "No VAT is charged."
6. If one utterance covers both CIS and VAT, split it into two sentences, one per topic.
7. If CIS or VAT is never mentioned, do not add a sentence about it.

Output only the cleaned transcript text."#;

/// System prompt for the invoice extraction stage.
///
/// `trade_context` biases terminology only; explicit spoken figures always win.
pub fn extraction_prompt(trade_context: &str) -> String {
    let trade = trade_context.trim();
    let trade_line = if trade.is_empty() {
        String::new()
    } else {
        format!(
            "\nThe speaker works as a {}. Use that only to disambiguate trade terminology; never let it override figures or facts the speaker stated.\n",
            trade
        )
    };

    format!(
        r#"You extract structured invoice fields from a cleaned transcript of a UK tradesperson describing a completed job.
{trade_line}
Rules:
- customer_name: the person or company being invoiced; empty string if none was mentioned.
- job_summary: one sentence describing the work done.
- labour_hours: hours of labour as a number; 0 if not mentioned.
- materials: each material mentioned, in order. If a price was spoken, set cost to that number; if a material was mentioned without a price, include it with cost null. Never drop a mentioned material.
- cis_job: "true" only if the transcript contains "This is a CIS job.", "false" only for "This is not a CIS job.", otherwise "unknown".
- vat_registered: "true" only for "VAT is charged.", "false" only for "No VAT is charged.", otherwise "unknown".
- notes: anything else worth keeping on the invoice (access notes, guarantees, follow-ups); empty string if none.
- Never invent amounts, names, or hours that were not spoken."#
    )
}

/// JSON schema for the extraction result.
pub fn extraction_schema() -> JsonSchemaSpec {
    JsonSchemaSpec {
        name: "invoice_draft",
        description: "Structured invoice fields extracted from a spoken job description.",
        schema: json!({
            "type": "object",
            "properties": {
                "customer_name": {
                    "type": "string",
                    "description": "Customer or company name exactly as spoken; empty string if none."
                },
                "job_summary": {
                    "type": "string",
                    "description": "One-sentence summary of the work performed."
                },
                "labour_hours": {
                    "type": "number",
                    "description": "Hours of labour; 0 if not stated."
                },
                "materials": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "description": { "type": "string" },
                            "cost": {
                                "type": ["number", "null"],
                                "description": "Price in pounds, or null when no price was spoken."
                            }
                        },
                        "required": ["description", "cost"],
                        "additionalProperties": false
                    }
                },
                "cis_job": {
                    "type": "string",
                    "enum": ["unknown", "true", "false"]
                },
                "vat_registered": {
                    "type": "string",
                    "enum": ["unknown", "true", "false"]
                },
                "notes": { "type": "string" }
            },
            "required": [
                "customer_name", "job_summary", "labour_hours",
                "materials", "cis_job", "vat_registered", "notes"
            ],
            "additionalProperties": false
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_prompt_mentions_trade() {
        let prompt = extraction_prompt("Plumber");
        assert!(prompt.contains("Plumber"));
        assert!(prompt.contains("never let it override"));
    }

    #[test]
    fn test_extraction_prompt_without_trade() {
        let prompt = extraction_prompt("  ");
        assert!(!prompt.contains("works as a"));
    }

    #[test]
    fn test_schema_requires_tristate_fields() {
        let spec = extraction_schema();
        let required = spec.schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "cis_job"));
        assert!(required.iter().any(|v| v == "vat_registered"));
    }
}

//! Integration tests that exercise the full pipeline with mock providers.

mod pipeline_integration_tests;

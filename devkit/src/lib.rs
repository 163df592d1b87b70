/*!
# Vigie DevKit - Stubs et utilitaires de test

Bibliothèque facilitant les tests de l'agent Vigie avec:
- Stub HTTP de l'API d'ingestion (wiremock)
- Helpers pour le contrat d'upload
- Harness de test (répertoire temporaire + stub)
*/

pub mod api_stub;
pub mod contract_helpers;
pub mod test_utils;

pub use api_stub::MockIngestApi;
pub use test_utils::TestHarness;

/*!
# Symbion DevKit - Stubs et Utilitaires pour la flotte

Bibliothèque facilitant le test de la couche de commande avec:
- Transport SSH mock (connexions, commandes scriptées, pannes, latence)
- Harness de flotte avec config réduite
- Échantillons de télémétrie au format réel
*/

pub mod harness;
pub mod mock_transport;

pub use harness::{FleetHarness, TelemetrySample};
pub use mock_transport::{MockExec, MockReply, MockTransport};

/**
 * ERREURS FLOTTE - Taxonomie des erreurs au niveau requête
 *
 * RÔLE : Erreurs qui font échouer un appel entier (id inconnu, workload inconnu,
 * moyennes indéfinies, config invalide). Les erreurs par nœud ne passent jamais
 * par ici : elles restent des valeurs dans la carte des résultats (voir dispatcher).
 */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("unknown node id: {0}")]
    NodeNotFound(String),

    #[error("unknown workload type: {0} (expected ai-inference, crypto-mining or akash-provider)")]
    UnknownWorkload(String),

    #[error("invalid service name '{0}': expected letters, digits, '.', '_' or '-'")]
    InvalidServiceName(String),

    #[error("no online nodes: fleet averages are undefined")]
    NoOnlineNodes,

    #[error("duplicate node id generated by template: {0}")]
    DuplicateNodeId(String),

    #[error("invalid template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("invalid earnings amount: {0}")]
    InvalidAmount(f64),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;

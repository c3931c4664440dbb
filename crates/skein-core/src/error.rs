use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkeinError {
    // Definition / compile errors
    #[error("Definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Definition '{0}' has no mappings")]
    EmptyDefinition(String),

    #[error("Entry point not found: {0}")]
    MissingEntryPoint(String),

    #[error("Output not found: {0}")]
    MissingOutput(String),

    #[error("No mapping from '{0}'")]
    NoMapping(String),

    #[error("Cycle detected at skill '{0}'")]
    Cycle(String),

    #[error("Mapping references unknown node '{0}'")]
    DanglingReference(String),

    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    #[error("Skill '{0}' declares no routes")]
    MissingAction(String),

    // Routing errors
    #[error("No matching route for skill '{skill}' and no default")]
    NoMatchingRoute { skill: String },

    #[error("Route for skill '{skill}' names no action")]
    RouteWithoutAction { skill: String },

    #[error("Route for skill '{skill}' names no output")]
    RouteWithoutOutput { skill: String },

    // Invocation errors
    #[error("Action failed: {action}: {message}")]
    ActionFailed { action: String, message: String },

    #[error("Activation not found: {0}")]
    ActivationNotFound(String),

    #[error("Plan for '{0}' contains asynchronous steps, synchronous invocation rejected")]
    NotSynchronous(String),

    #[error("Secret resolution failed: {0}")]
    SecretResolution(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    // Callback errors
    #[error("Callback delivery failed: {0}")]
    Callback(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SkeinError>;

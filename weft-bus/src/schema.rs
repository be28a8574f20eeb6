use jsonschema::Validator;
use serde_json::Value;

/// Error building a schema gate.
#[derive(Debug, Clone)]
pub enum SchemaError {
    /// The schema document itself does not compile.
    Invalid(String),
    /// `strict` was requested without a schema to enforce.
    StrictWithoutSchema,
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaError::Invalid(msg) => write!(f, "schema does not compile: {msg}"),
            SchemaError::StrictWithoutSchema => {
                write!(f, "strict validation requires a schema")
            }
        }
    }
}

impl std::error::Error for SchemaError {}

/// What to do with a payload after validation.
#[derive(Debug)]
pub enum GateDecision {
    /// Valid, or no schema declared.
    Deliver,
    /// Invalid but the gate is lax: deliver the original payload, warn.
    DeliverWarn(String),
    /// Invalid and the gate is strict: drop, log an error.
    Drop(String),
}

/// Compiled schema plus the strictness policy of one subscription or
/// route.
pub struct SchemaGate {
    validator: Option<Validator>,
    strict: bool,
}

impl SchemaGate {
    pub fn new(schema: Option<&Value>, strict: bool) -> Result<Self, SchemaError> {
        let validator = match schema {
            Some(doc) => Some(compile(doc)?),
            None if strict => return Err(SchemaError::StrictWithoutSchema),
            None => None,
        };
        Ok(Self { validator, strict })
    }

    /// A gate that never rejects, for the schema-less lax case.
    pub fn open() -> Self {
        Self {
            validator: None,
            strict: false,
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn check(&self, data: &Value) -> GateDecision {
        let Some(validator) = &self.validator else {
            return GateDecision::Deliver;
        };
        match validator.validate(data) {
            Ok(()) => GateDecision::Deliver,
            Err(err) => {
                let reason = format!("{err}");
                if self.strict {
                    GateDecision::Drop(reason)
                } else {
                    GateDecision::DeliverWarn(reason)
                }
            }
        }
    }
}

/// Compile a JSON Schema document.
pub fn compile(schema: &Value) -> Result<Validator, SchemaError> {
    jsonschema::validator_for(schema).map_err(|e| SchemaError::Invalid(e.to_string()))
}

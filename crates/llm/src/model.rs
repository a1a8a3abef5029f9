#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub const FLASH_MODEL_ID: &str = "gemini-3-flash-preview";
pub const PRO_MODEL_ID: &str = "gemini-3-pro-preview";
pub const DEFAULT_GEMINI_MODEL: &str = FLASH_MODEL_ID;

pub fn default_gemini_models() -> Vec<Model> {
    vec![
        Model::new(FLASH_MODEL_ID, "Aetheris Flash").with_description("Fast default model"),
        Model::new(PRO_MODEL_ID, "Aetheris Pro").with_description("Higher quality reasoning"),
    ]
}

/// Resolves a model id, a display name, or a short alias such as `flash` or `pro`.
pub fn resolve_model(query: &str) -> Option<Model> {
    let query = query.trim();
    if query.is_empty() {
        return None;
    }

    default_gemini_models().into_iter().find(|model| {
        model.id.eq_ignore_ascii_case(query)
            || model.name.eq_ignore_ascii_case(query)
            || model
                .name
                .rsplit(' ')
                .next()
                .is_some_and(|alias| alias.eq_ignore_ascii_case(query))
    })
}

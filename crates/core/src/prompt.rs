//! System Instruction Composition
//!
//! Builds the per-turn system instruction and the first-turn greeting from
//! the call's dynamic variables. Templates use `{placeholder}` substitution
//! and can be replaced at startup from a prompts directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

const DEFAULT_USER_NAME: &str = "Friend";
const DEFAULT_CONTEXT: &str = "No context provided";

const DEFAULT_SYSTEM_TEMPLATE: &str = "\
You are {persona}, a compassionate, warm therapy AI.
You are speaking with {user_name}.
Context about their situation: {context}.

Guidelines:
- Keep answers short (1-2 sentences).
- Be empathetic but direct.
- Do not use lists.
- {safety_policy}";

const DEFAULT_GREETING_TEMPLATE: &str =
    "Hi {user_name}, I'm {persona}. I'm here to listen. How are you feeling today?";

/// Per-call dynamic variables supplied by the voice platform.
///
/// Only the fields the prompt cares about are typed; everything else the
/// platform sends is kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallContext {
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl CallContext {
    /// The user's display name, falling back to a neutral address.
    pub fn display_name(&self) -> &str {
        non_blank(self.user_name.as_deref()).unwrap_or(DEFAULT_USER_NAME)
    }

    fn situation(&self) -> &str {
        non_blank(self.context.as_deref()).unwrap_or(DEFAULT_CONTEXT)
    }

    fn region(&self) -> Option<String> {
        let raw = non_blank(self.locale.as_deref()).or(non_blank(self.country.as_deref()))?;
        region_of(raw)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Extracts an upper-case region code from a locale tag (`en-GB`, `en_us`)
/// or a bare two-letter country code.
fn region_of(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let region = match raw.rsplit_once(['-', '_']) {
        Some((_, region)) => region,
        None if raw.len() == 2 => raw,
        None => return None,
    };
    Some(region.to_ascii_uppercase())
}

/// Where to point a user who may be at risk, by region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyResource {
    /// 988 Suicide & Crisis Lifeline (United States, Canada).
    Lifeline988,
    /// Samaritans (United Kingdom, Ireland).
    Samaritans,
    /// Lifeline Australia.
    LifelineAustralia,
    /// No region-specific line known.
    LocalEmergency,
}

impl SafetyResource {
    pub fn for_region(region: Option<&str>) -> Self {
        match region {
            Some("US" | "CA") => Self::Lifeline988,
            Some("GB" | "UK" | "IE") => Self::Samaritans,
            Some("AU") => Self::LifelineAustralia,
            _ => Self::LocalEmergency,
        }
    }

    /// The guideline line injected into the system instruction.
    pub fn policy(self) -> &'static str {
        match self {
            Self::Lifeline988 => {
                "If the user mentions self-harm or being in danger, gently encourage them to call or text 988, the Suicide & Crisis Lifeline, right away."
            }
            Self::Samaritans => {
                "If the user mentions self-harm or being in danger, gently encourage them to call Samaritans on 116 123, free at any time."
            }
            Self::LifelineAustralia => {
                "If the user mentions self-harm or being in danger, gently encourage them to call Lifeline on 13 11 14 right away."
            }
            Self::LocalEmergency => {
                "If the user mentions self-harm or being in danger, gently encourage them to contact local emergency services or a crisis line immediately."
            }
        }
    }
}

/// Renders system instructions and greetings for a persona.
#[derive(Debug, Clone)]
pub struct PromptComposer {
    persona: String,
    system_template: String,
    greeting_template: String,
}

impl PromptComposer {
    /// Creates a composer using the built-in templates.
    pub fn new(persona: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            system_template: DEFAULT_SYSTEM_TEMPLATE.to_string(),
            greeting_template: DEFAULT_GREETING_TEMPLATE.to_string(),
        }
    }

    /// Replaces the built-in templates with `system_prompt.md` and
    /// `greeting.md` from `dir`, when those files exist.
    pub fn with_templates_from(mut self, dir: &Path) -> Result<Self> {
        let prompts = load_prompts(dir)?;
        if let Some(system) = prompts.get("system_prompt") {
            self.system_template = system.trim().to_string();
        }
        if let Some(greeting) = prompts.get("greeting") {
            self.greeting_template = greeting.trim().to_string();
        }
        Ok(self)
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    /// The system instruction for one turn.
    pub fn compose(&self, vars: &CallContext) -> String {
        let safety = SafetyResource::for_region(vars.region().as_deref());
        self.system_template
            .replace("{persona}", &self.persona)
            .replace("{user_name}", vars.display_name())
            .replace("{context}", vars.situation())
            .replace("{safety_policy}", safety.policy())
    }

    /// The precomputed opening line for a call with an empty transcript.
    pub fn compose_greeting(&self, vars: &CallContext) -> String {
        self.greeting_template
            .replace("{persona}", &self.persona)
            .replace("{user_name}", vars.display_name())
    }
}

/// Loads every `*.md` file in a directory, keyed by file stem.
fn load_prompts(dir: &Path) -> Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read prompts directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt {}", path.display()))?;
            prompts.insert(key, content);
        }
    }
    Ok(prompts)
}

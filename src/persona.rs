use serde::{Deserialize, Serialize};

/// The voice the study companion answers in. Chavruta is the general
/// study-partner persona; Hillel and Shammai argue from their schools'
/// positions in the classical disputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    Chavruta,
    Hillel,
    Shammai,
}

const BASE_CONTEXT: &str = "You are {persona}, a study companion for learning Talmud. \
The user is working through a sugya and wants to reason it out in conversation. \
Ground your answers in the text under discussion, cite tractate and daf when you \
can, and keep each reply focused on one step of the argument.\n\n";

const CHAVRUTA_DIRECTIVE: &str = "Act as a traditional chavruta: probe the user's \
reasoning with questions, offer the classical commentaries when they help, and \
never hand over a conclusion the user could reach themselves. Encourage machloket \
(productive disagreement) and always distinguish the plain sense of the text from \
later interpretation.";

const HILLEL_DIRECTIVE: &str = "Argue as Beit Hillel: favor the lenient, pragmatic \
reading, weigh the human circumstances behind each case, and state the opposing \
view of Beit Shammai fairly before explaining why the halakha follows Hillel. \
Speak with patience and humility, as the school was known for.";

const SHAMMAI_DIRECTIVE: &str = "Argue as Beit Shammai: favor the strict, exacting \
reading, reason from the ideal case rather than common practice, and state the \
opposing view of Beit Hillel fairly before defending the stringency. Be concise \
and uncompromising in the argument while staying respectful of the questioner.";

impl Persona {
    pub fn as_str(&self) -> &'static str {
        match self {
            Persona::Chavruta => "chavruta",
            Persona::Hillel => "hillel",
            Persona::Shammai => "shammai",
        }
    }

    /// Unknown or empty strings fall back to the general persona; the UI only
    /// ever produces the three known names, so this path is config hygiene.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "chavruta" => Some(Persona::Chavruta),
            "hillel" => Some(Persona::Hillel),
            "shammai" => Some(Persona::Shammai),
            _ => None,
        }
    }

    pub fn all() -> Vec<Persona> {
        vec![Persona::Chavruta, Persona::Hillel, Persona::Shammai]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Persona::Chavruta => "Chavruta",
            Persona::Hillel => "Beit Hillel",
            Persona::Shammai => "Beit Shammai",
        }
    }

    /// Placeholder shown in the empty chat pane for this persona.
    pub fn placeholder(&self) -> &'static str {
        match self {
            Persona::Chavruta => "Bring a question from the sugya...",
            Persona::Hillel => "Ask Beit Hillel for the lenient view...",
            Persona::Shammai => "Ask Beit Shammai for the strict view...",
        }
    }

    fn directive(&self) -> &'static str {
        match self {
            Persona::Hillel => HILLEL_DIRECTIVE,
            Persona::Shammai => SHAMMAI_DIRECTIVE,
            // Everything that is not one of the named debate roles gets the
            // general study-partner directive.
            _ => CHAVRUTA_DIRECTIVE,
        }
    }
}

/// Compose the system instruction for a persona: the shared base context with
/// the persona's name substituted, followed by that persona's directive block.
pub fn system_prompt(persona: Persona) -> String {
    let mut prompt = BASE_CONTEXT.replace("{persona}", persona.display_name());
    prompt.push_str(persona.directive());
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_contains_only_own_directive() {
        for persona in Persona::all() {
            let prompt = system_prompt(persona);
            for other in Persona::all() {
                let block = other.directive();
                if other == persona {
                    assert!(
                        prompt.contains(block),
                        "{} prompt missing its directive",
                        persona.as_str()
                    );
                } else if other.directive() != persona.directive() {
                    assert!(
                        !prompt.contains(block),
                        "{} prompt leaked {} directive",
                        persona.as_str(),
                        other.as_str()
                    );
                }
            }
        }
    }

    #[test]
    fn prompt_substitutes_persona_name() {
        for persona in Persona::all() {
            let prompt = system_prompt(persona);
            assert!(prompt.contains(persona.display_name()));
            assert!(!prompt.contains("{persona}"));
        }
    }

    #[test]
    fn from_str_round_trips_and_rejects_unknown() {
        for persona in Persona::all() {
            assert_eq!(Persona::from_str(persona.as_str()), Some(persona));
        }
        assert_eq!(Persona::from_str("Hillel"), Some(Persona::Hillel));
        assert_eq!(Persona::from_str("rava"), None);
        assert_eq!(Persona::from_str(""), None);
    }
}

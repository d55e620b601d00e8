use rand::seq::SliceRandom;

pub const DEFAULT_INSTRUCTION: &str = "Respond with exactly one word.";

pub const DEFAULT_PROMPTS: [&str; 15] = [
    "Name any color",
    "Pick a planet",
    "Choose a season",
    "Say an animal",
    "Pick a programming language",
    "Name a fruit",
    "Name a country",
    "Pick a number between 1 and 100",
    "Name a musical instrument",
    "Pick a day of the week",
    "Name a vegetable",
    "Choose a month",
    "Name a sport",
    "Pick an ocean",
    "Name a bird",
];

/// Questions to rotate through; one is drawn at random per fire.
#[derive(Debug, Clone)]
pub struct PromptBook {
    prompts: Vec<String>,
}

impl PromptBook {
    /// Blank entries are dropped; an empty list falls back to the defaults.
    pub fn new(prompts: Vec<String>) -> Self {
        let prompts: Vec<String> = prompts
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if prompts.is_empty() {
            return Self::default();
        }
        Self { prompts }
    }

    #[cfg(test)]
    pub fn fixed(prompt: impl Into<String>) -> Self {
        Self::new(vec![prompt.into()])
    }

    pub fn pick(&self) -> &str {
        self.prompts
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or(DEFAULT_PROMPTS[0])
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }
}

impl Default for PromptBook {
    fn default() -> Self {
        Self {
            prompts: DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

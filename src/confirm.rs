use crate::Result;
use std::io::{self, Write};

/// Asks the operator a yes/no question before a risky step.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Reads the answer from the terminal. Only a literal `yes` counts.
pub struct ConsolePrompt;

impl Confirm for ConsolePrompt {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        print!("{} (yes) ", prompt);
        io::stdout().flush().ok();

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(is_yes(&input))
    }
}

/// Answers yes without asking, for `--yes`.
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

pub fn is_yes(answer: &str) -> bool {
    answer.trim() == "yes"
}

//! Prompt handling: where the prompt comes from, weighted sub-prompts and
//! the directory name derived from it.
use anyhow::Context;
use std::io::BufRead;

use crate::config::PromptSource;

const MAX_DIR_NAME_LEN: usize = 150;

/// A piece of the prompt and its relative weight in the conditioning.
#[derive(Debug, Clone, PartialEq)]
pub struct SubPrompt {
    pub text: String,
    pub weight: f64,
}

pub fn resolve(source: &PromptSource) -> anyhow::Result<String> {
    match source {
        PromptSource::Text(text) => Ok(text.clone()),
        PromptSource::File(path) => {
            let file = crate::utils::file_open(path)?;
            let first = std::io::BufReader::new(file).lines().next();
            match first {
                Some(line) => line.with_context(|| format!("error reading {path:?}")),
                None => anyhow::bail!("prompt file {path:?} is empty"),
            }
        }
    }
}

/// Splits `"a castle:0.7 a lake:0.3"` into weighted sub-prompts.
///
/// A `:` ends a sub-prompt, the weight runs up to the next space. Weights
/// that are missing or fail to parse count as 1.
pub fn split_weighted_subprompts(text: &str) -> Vec<SubPrompt> {
    let mut prompts = vec![];
    let mut text = text;
    while !text.is_empty() {
        let Some(colon) = text.find(':') else {
            prompts.push(SubPrompt { text: text.to_string(), weight: 1.0 });
            break;
        };
        let prompt = &text[..colon];
        let rest = &text[colon + 1..];
        let end = rest.find(' ').unwrap_or(rest.len());
        let weight = if end == 0 {
            1.0
        } else {
            match rest[..end].parse::<f64>() {
                Ok(weight) => weight,
                Err(_) => {
                    tracing::warn!("weight {:?} is not a number, using 1.0", &rest[..end]);
                    1.0
                }
            }
        };
        prompts.push(SubPrompt { text: prompt.to_string(), weight });
        text = rest.get(end + 1..).unwrap_or("");
    }
    prompts
}

/// Weights normalized so that they sum to one. Falls back to uniform weights
/// when the total is not positive.
pub fn normalized_weights(prompts: &[SubPrompt]) -> Vec<f64> {
    let total: f64 = prompts.iter().map(|p| p.weight).sum();
    if total > 0. {
        prompts.iter().map(|p| p.weight / total).collect()
    } else {
        vec![1. / prompts.len() as f64; prompts.len()]
    }
}

/// Directory name for the samples of a prompt: words joined with `_`, non
/// word characters removed.
pub fn sanitize_for_path(prompt: &str) -> anyhow::Result<String> {
    let joined = prompt.split_whitespace().collect::<Vec<_>>().join("_");
    let re = regex::Regex::new(r"\W+")?;
    Ok(re.replace_all(&joined, "").chars().take(MAX_DIR_NAME_LEN).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sp(text: &str, weight: f64) -> SubPrompt {
        SubPrompt { text: text.to_string(), weight }
    }

    #[test]
    fn plain_prompt() {
        assert_eq!(split_weighted_subprompts("a red barn"), vec![sp("a red barn", 1.0)]);
        assert!(split_weighted_subprompts("").is_empty());
    }

    #[test]
    fn weighted_prompts() {
        assert_eq!(
            split_weighted_subprompts("a cat:0.7 a dog:0.3"),
            vec![sp("a cat", 0.7), sp("a dog", 0.3)]
        );
        assert_eq!(
            split_weighted_subprompts("forest:2 in winter"),
            vec![sp("forest", 2.0), sp("in winter", 1.0)]
        );
    }

    #[test]
    fn missing_or_bad_weight() {
        assert_eq!(split_weighted_subprompts("a cat:"), vec![sp("a cat", 1.0)]);
        assert_eq!(split_weighted_subprompts("a:b c"), vec![sp("a", 1.0), sp("c", 1.0)]);
    }

    #[test]
    fn weights_normalize() {
        let w = normalized_weights(&[sp("a", 3.0), sp("b", 1.0)]);
        assert_eq!(w, vec![0.75, 0.25]);
        let w = normalized_weights(&[sp("a", 0.0), sp("b", 0.0)]);
        assert_eq!(w, vec![0.5, 0.5]);
    }

    #[test]
    fn sanitize() {
        assert_eq!(
            sanitize_for_path("a painting of a virus monster, playing guitar!").unwrap(),
            "a_painting_of_a_virus_monster_playing_guitar"
        );
        assert_eq!(sanitize_for_path("  spaced   out ").unwrap(), "spaced_out");
        let long = "x ".repeat(200);
        assert_eq!(sanitize_for_path(&long).unwrap().chars().count(), 150);
    }

    #[test]
    fn prompt_from_file_uses_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts.txt");
        std::fs::write(&path, "first prompt\nsecond prompt\n").unwrap();
        let prompt = resolve(&PromptSource::File(path)).unwrap();
        assert_eq!(prompt, "first prompt");

        let empty = dir.path().join("empty.txt");
        std::fs::write(&empty, "").unwrap();
        assert!(resolve(&PromptSource::File(empty)).is_err());
    }
}

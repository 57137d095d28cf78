//! Command blocklist enforced through shell parsing.
//!
//! Scripts are split into pipeline segments (respecting quotes and escapes),
//! each segment is tokenised with `shell_words`, and tokens carrying
//! parameter/command/arithmetic/process substitutions are flagged dynamic so
//! strict mode can refuse commands whose executable cannot be known
//! statically. Substring matching alone is bypassable; this is the minimum
//! honest parse.

use anyhow::{anyhow, Result};

use super::Guard;

struct Invocation {
    name: String,
    args: Vec<String>,
    name_dynamic: bool,
}

impl Guard {
    /// Check a shell script against the configured command policy.
    pub fn check_command(&self, script: &str) -> Result<()> {
        let script = script.trim();
        if script.is_empty() {
            return Ok(());
        }
        let strict = self.config().is_strict();

        let invocations = match parse_invocations(script) {
            Ok(inv) => inv,
            Err(e) => {
                if strict {
                    return Err(anyhow!("command parse failed in strict mode: {e}"));
                }
                return Ok(());
            }
        };

        let blocked_execs = lower_set(&self.config().blocked_executables);
        let allow_execs = lower_set(&self.config().allow_executables);
        let rules = build_blocked_rules(&self.config().blocked_patterns);

        for inv in &invocations {
            if inv.args.is_empty() {
                continue;
            }

            if inv.name.is_empty() || inv.name_dynamic {
                if strict {
                    return Err(anyhow!("dynamic command name is not allowed in strict mode"));
                }
                continue;
            }

            if allow_execs.contains(&inv.name) {
                continue;
            }

            if is_indirect_execution(inv) {
                if strict {
                    return Err(anyhow!(
                        "indirect command execution is blocked in strict mode: {:?}",
                        inv.name
                    ));
                }
                continue;
            }

            if blocked_execs.contains(&inv.name) {
                if !strict && !is_high_confidence(&inv.args) {
                    continue;
                }
                return Err(anyhow!("command uses blocked executable: {:?}", inv.name));
            }

            for rule in &rules {
                if !matches_rule(&inv.args, rule) {
                    continue;
                }
                if !strict && !is_high_confidence(&inv.args) && !is_high_confidence(rule) {
                    continue;
                }
                return Err(anyhow!(
                    "command matches blocked pattern: {:?}",
                    rule.join(" ")
                ));
            }
        }

        Ok(())
    }
}

/// Split a script into simple-command invocations and tokenise each one.
fn parse_invocations(script: &str) -> Result<Vec<Invocation>, String> {
    let mut invocations = Vec::new();
    for segment in split_segments(script) {
        let raw = raw_words(&segment);
        let tokens = shell_words::split(&segment).map_err(|e| e.to_string())?;
        debug_assert!(raw.len() >= tokens.len() || raw.is_empty());

        // Leading VAR=value assignments are not the executable.
        let skip = raw
            .iter()
            .take_while(|w| is_env_assignment(w))
            .count()
            .min(tokens.len());

        let args: Vec<String> = tokens[skip..]
            .iter()
            .map(|t| t.trim().to_ascii_lowercase())
            .collect();
        if args.is_empty() {
            continue;
        }
        let name_dynamic = raw
            .get(skip)
            .map(|w| word_is_dynamic(w))
            .unwrap_or(false);

        invocations.push(Invocation {
            name: args[0].clone(),
            args,
            name_dynamic,
        });
    }
    Ok(invocations)
}

/// Split on `;`, `|`, `||`, `&`, `&&` and newlines, outside quotes.
fn split_segments(script: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    let mut chars = script.chars().peekable();

    while let Some(ch) = chars.next() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if !in_single => {
                current.push(ch);
                escaped = true;
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(ch);
            }
            ';' | '\n' if !in_single && !in_double => {
                push_segment(&mut segments, &mut current);
            }
            '|' | '&' if !in_single && !in_double => {
                if matches!(chars.peek(), Some(next) if *next == ch) {
                    let _ = chars.next();
                }
                push_segment(&mut segments, &mut current);
            }
            _ => current.push(ch),
        }
    }
    push_segment(&mut segments, &mut current);
    segments
}

fn push_segment(segments: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed.to_string());
    }
    current.clear();
}

/// Whitespace-split a segment keeping the raw (still-quoted) text of each
/// word, so substitution markers survive for dynamism checks.
fn raw_words(segment: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for ch in segment.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if !in_single => {
                current.push(ch);
                escaped = true;
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(ch);
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// A word is dynamic when it carries a substitution that only the shell can
/// resolve: `$var`, `${var}`, `$(cmd)`, `$((expr))`, backticks, or process
/// substitution. Single-quoted text never substitutes.
fn word_is_dynamic(raw: &str) -> bool {
    let mut in_single = false;
    let mut escaped = false;
    let mut chars = raw.chars().peekable();

    while let Some(ch) = chars.next() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if !in_single => escaped = true,
            '\'' => in_single = !in_single,
            '$' | '`' if !in_single => return true,
            '<' | '>' if !in_single => {
                if matches!(chars.peek(), Some('(')) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

fn is_env_assignment(word: &str) -> bool {
    let Some((key, _)) = word.split_once('=') else {
        return false;
    };
    !key.is_empty()
        && key
            .chars()
            .all(|c| c == '_' || c.is_ascii_alphanumeric())
        && !key.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn is_indirect_execution(inv: &Invocation) -> bool {
    match inv.name.as_str() {
        "eval" | "." | "source" => true,
        "sh" | "bash" | "zsh" | "ksh" => inv.args.get(1).is_some_and(|a| a == "-c"),
        _ => false,
    }
}

fn lower_set(items: &[String]) -> std::collections::HashSet<String> {
    items
        .iter()
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn build_blocked_rules(patterns: &[String]) -> Vec<Vec<String>> {
    patterns
        .iter()
        .filter_map(|p| {
            let tokens: Vec<String> = shell_words::split(p)
                .unwrap_or_else(|_| p.split_whitespace().map(ToString::to_string).collect())
                .iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .collect();
            (!tokens.is_empty()).then_some(tokens)
        })
        .collect()
}

/// Prefix match: every rule token must equal the invocation token at the
/// same position.
fn matches_rule(args: &[String], rule: &[String]) -> bool {
    if rule.is_empty() || args.len() < rule.len() {
        return false;
    }
    rule.iter().zip(args).all(|(r, a)| r == a)
}

/// Argument shapes that are destructive beyond doubt; these deny even in
/// permissive mode.
fn is_high_confidence(args: &[String]) -> bool {
    let Some(name) = args.first() else {
        return false;
    };
    match name.as_str() {
        "rm" => {
            args.iter()
                .skip(1)
                .any(|a| matches!(a.as_str(), "-rf" | "-fr" | "--no-preserve-root"))
                && args.iter().skip(1).any(|a| a == "/")
        }
        "dd" => args.iter().skip(1).any(|a| a.starts_with("if=/dev/zero")),
        "sudo" if args.len() > 1 => is_high_confidence(&args[1..]),
        _ => name.starts_with("mkfs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SafetyConfig, SAFETY_MODE_PERMISSIVE};

    fn guard(mode: &str) -> Guard {
        let dir = std::env::temp_dir();
        let cfg = SafetyConfig {
            mode: mode.to_string(),
            blocked_executables: vec![
                "shutdown".to_string(),
                "dd".to_string(),
                "sudo".to_string(),
                "mkfs.ext4".to_string(),
            ],
            blocked_patterns: vec![
                "rm -rf /".to_string(),
                "git push --force".to_string(),
            ],
            allow_executables: vec!["make".to_string()],
            ..Default::default()
        };
        Guard::new(cfg, &dir).unwrap()
    }

    #[test]
    fn empty_script_allowed() {
        assert!(guard("strict").check_command("   ").is_ok());
    }

    #[test]
    fn plain_commands_allowed() {
        let g = guard("strict");
        assert!(g.check_command("ls -la").is_ok());
        assert!(g.check_command("cargo test && git status").is_ok());
        assert!(g.check_command("echo hello | grep h").is_ok());
    }

    #[test]
    fn blocked_executable_denied() {
        let g = guard("strict");
        assert!(g.check_command("shutdown -h now").is_err());
    }

    #[test]
    fn blocked_pattern_prefix_matches() {
        let g = guard("strict");
        assert!(g.check_command("rm -rf / --no-preserve-root").is_err());
        assert!(g.check_command("git push --force origin main").is_err());
        // prefix must match token-for-token
        assert!(g.check_command("git push origin main").is_ok());
    }

    #[test]
    fn pattern_found_in_later_pipeline_segment() {
        let g = guard("strict");
        assert!(g.check_command("echo ok && rm -rf /").is_err());
        assert!(g.check_command("echo ok; shutdown now").is_err());
    }

    #[test]
    fn dynamic_executable_denied_in_strict() {
        let g = guard("strict");
        assert!(g.check_command("$CMD --do-things").is_err());
        assert!(g.check_command("`which python` script.py").is_err());
        assert!(g.check_command("$(get-tool) run").is_err());
    }

    #[test]
    fn dynamic_executable_allowed_in_permissive() {
        let g = guard(SAFETY_MODE_PERMISSIVE);
        assert!(g.check_command("$CMD --do-things").is_ok());
    }

    #[test]
    fn single_quoted_dollar_is_not_dynamic() {
        let g = guard("strict");
        assert!(g.check_command("echo '$HOME'").is_ok());
    }

    #[test]
    fn indirect_execution_strict_only() {
        let strict = guard("strict");
        assert!(strict.check_command("eval ls").is_err());
        assert!(strict.check_command("source ./setup.sh").is_err());
        assert!(strict.check_command("bash -c 'rm file'").is_err());
        // plain interpreter invocation is fine
        assert!(strict.check_command("bash script.sh").is_ok());

        let permissive = guard(SAFETY_MODE_PERMISSIVE);
        assert!(permissive.check_command("eval ls").is_ok());
        assert!(permissive.check_command("sh -c 'ls'").is_ok());
    }

    #[test]
    fn parse_failure_denied_in_strict_allowed_in_permissive() {
        assert!(guard("strict").check_command("echo 'unterminated").is_err());
        assert!(guard(SAFETY_MODE_PERMISSIVE)
            .check_command("echo 'unterminated")
            .is_ok());
    }

    #[test]
    fn allow_list_wins_over_block_rules() {
        let g = guard("strict");
        assert!(g.check_command("make clean").is_ok());
    }

    #[test]
    fn permissive_blocks_only_high_confidence() {
        let g = guard(SAFETY_MODE_PERMISSIVE);
        // blocked executable, but not provably destructive
        assert!(g.check_command("shutdown --help").is_ok());
        // unmistakably destructive forms still deny
        assert!(g.check_command("rm -rf /").is_err());
        assert!(g.check_command("sudo rm -rf /").is_err());
        assert!(g.check_command("mkfs.ext4 /dev/sda1").is_err());
        assert!(g.check_command("dd if=/dev/zero of=/dev/sda").is_err());
    }

    #[test]
    fn env_prefix_does_not_hide_executable() {
        let g = guard("strict");
        assert!(g.check_command("FOO=1 shutdown now").is_err());
        assert!(g.check_command("FOO=1 BAR=2 ls").is_ok());
    }

    #[test]
    fn case_insensitive_matching() {
        let g = guard("strict");
        assert!(g.check_command("SHUTDOWN now").is_err());
    }
}

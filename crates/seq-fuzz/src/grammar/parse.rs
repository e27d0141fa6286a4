//! Text-level parsing of grammar files.
//!
//! A grammar file carries one top-level `Grammar( ... )` block of
//! comma-separated rules `symbol := derivation`. Alternatives are separated
//! by `|`, concatenated productions by `~`. Non-terminals are prefixed with
//! a single quote, terminal literals are double-quoted (with `\xNN` byte
//! escapes), and `'WGT_<float>` pseudo-tokens weight an alternative.
//! Whitespace outside quoted spans is insignificant.

/// Strips all whitespace that is not inside a double-quoted span.
pub fn remove_whitespace_outside_quotes(value: &mut String) {
    let mut out = String::with_capacity(value.len());
    let mut in_quotes = false;
    let mut escaped = false;
    for c in value.chars() {
        if in_quotes {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quotes = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_quotes = true;
                out.push(c);
            }
            c if c.is_whitespace() => {}
            c => out.push(c),
        }
    }
    *value = out;
}

/// Splits `value` on `delimiter`, ignoring delimiters inside double-quoted
/// spans. Empty pieces are kept; they encode empty-word alternatives.
pub fn split_outside_quotes(value: &str, delimiter: &str, trim: bool) -> Vec<String> {
    let bytes = value.as_bytes();
    let delim = delimiter.as_bytes();
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut index = 0;
    while index < bytes.len() {
        let c = bytes[index] as char;
        if in_quotes {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quotes = false;
            }
            index += 1;
            continue;
        }
        if c == '"' {
            in_quotes = true;
            current.push(c);
            index += 1;
            continue;
        }
        if bytes[index..].starts_with(delim) {
            pieces.push(current);
            current = String::new();
            index += delim.len();
            continue;
        }
        current.push(c);
        index += 1;
    }
    pieces.push(current);
    if trim {
        for piece in &mut pieces {
            let trimmed = trim_outside_quotes(piece);
            *piece = trimmed;
        }
    }
    pieces
}

fn trim_outside_quotes(piece: &str) -> String {
    // Leading and trailing whitespace can never be inside a quoted span.
    piece.trim().to_owned()
}

/// Counts occurrences of `symbol` outside double-quoted spans.
pub fn count_symbols(value: &str, symbol: char) -> i32 {
    let mut count = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for c in value.chars() {
        if in_quotes {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quotes = false;
            }
            continue;
        }
        if c == '"' {
            in_quotes = true;
        } else if c == symbol {
            count += 1;
        }
    }
    count
}

/// A production referencing a non-terminal carries an unquoted single quote.
pub fn is_nonterminal_reference(production: &str) -> bool {
    let mut in_quotes = false;
    let mut escaped = false;
    for c in production.chars() {
        if in_quotes {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quotes = false;
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            '\'' => return true,
            _ => {}
        }
    }
    false
}

/// Extracts the weight from a `'WGT_<float>` pseudo-token.
pub fn parse_weight(production: &str) -> Option<f32> {
    let rest = production.split_once("'WGT_")?.1;
    match rest.parse::<f32>() {
        Ok(weight) => Some(weight),
        Err(_) => {
            tracing::warn!(token = %production, "cannot extract weight from symbol");
            // Recognized as a weight token regardless, so it never becomes a
            // terminal by accident.
            Some(0.0)
        }
    }
}

/// A production of only whitespace derives the empty word.
pub fn is_empty_production(production: &str) -> bool {
    production.chars().all(|c| c == ' ' || c == '\t')
}

/// Turns a terminal production into its literal content: surrounding quotes
/// are dropped and `\xNN`, `\"` and `\\` escapes are resolved.
pub fn unescape_terminal(production: &str) -> String {
    let mut out = String::with_capacity(production.len());
    let mut chars = production.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {}
            '\\' => match chars.next() {
                Some('x') => {
                    let hex: String = chars.by_ref().take(2).collect();
                    match u8::from_str_radix(&hex, 16) {
                        Ok(byte) => out.push(byte as char),
                        Err(_) => {
                            out.push('x');
                            out.push_str(&hex);
                        }
                    }
                }
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => out.push(other),
                None => {}
            },
            c => out.push(c),
        }
    }
    out
}

/// Locates the first balanced `Grammar( ... )` block and returns its inner
/// text with rules joined into a single line. `None` when no block opens or
/// the brackets never balance.
pub fn extract_grammar_block(text: &str) -> Option<String> {
    let mut in_grammar = false;
    let mut grammar = String::new();
    let mut open = 0;
    let mut closed = 0;
    let mut balanced = false;
    for line in text.lines() {
        let line = line.trim_start_matches([' ', '\t']);
        if line.is_empty() {
            continue;
        }
        if !in_grammar {
            if let Some(position) = line.find("Grammar(") {
                in_grammar = true;
                let rest = &line[position + "Grammar(".len()..];
                grammar.push_str(rest);
                open += count_symbols(rest, '(');
                closed += count_symbols(rest, ')');
            } else {
                continue;
            }
        } else {
            grammar.push_str(line);
            open += count_symbols(line, '(');
            closed += count_symbols(line, ')');
        }
        if closed == open + 1 {
            balanced = true;
            break;
        }
    }
    if !in_grammar || !balanced {
        return None;
    }
    let last = grammar.rfind(')')?;
    grammar.truncate(last);
    Some(grammar)
}

/// One parsed `symbol := derivation` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRule {
    pub symbol: String,
    pub derivation: String,
    pub sequence: bool,
}

/// Splits a grammar block into its rules.
pub fn split_rules(block: &str) -> Vec<RawRule> {
    let mut rules = Vec::new();
    for rule in split_outside_quotes(block, ",", true) {
        if rule.is_empty() {
            continue;
        }
        let mut rule = rule.replace(['\n', '\r'], "");
        remove_whitespace_outside_quotes(&mut rule);
        let parts = split_outside_quotes(&rule, ":=", true);
        if let [symbol, derivation] = &parts[..] {
            rules.push(RawRule {
                sequence: symbol.contains("'SEQ"),
                symbol: symbol.clone(),
                derivation: derivation.clone(),
            });
        } else {
            tracing::warn!(rule = %rule, pieces = parts.len(), "rule cannot be read");
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_survives_only_in_quotes() {
        let mut s = "'a := \"x y\" ~ 'b".to_owned();
        remove_whitespace_outside_quotes(&mut s);
        assert_eq!(s, "'a:=\"x y\"~'b");
    }

    #[test]
    fn split_ignores_quoted_delimiters() {
        let pieces = split_outside_quotes("\"a|b\" | 'c", "|", true);
        assert_eq!(pieces, vec!["\"a|b\"".to_owned(), "'c".to_owned()]);
    }

    #[test]
    fn split_keeps_empty_alternatives() {
        let pieces = split_outside_quotes(" | 'a ~ 'b", "|", true);
        assert_eq!(pieces.len(), 2);
        assert!(pieces[0].is_empty());
    }

    #[test]
    fn weight_tokens_parse() {
        assert_eq!(parse_weight("'WGT_0.5"), Some(0.5));
        assert_eq!(parse_weight("'WGT_3"), Some(3.0));
        assert_eq!(parse_weight("'stmt"), None);
        assert_eq!(parse_weight("\"text\""), None);
    }

    #[test]
    fn nonterminal_references_are_detected() {
        assert!(is_nonterminal_reference("'stmt"));
        assert!(is_nonterminal_reference("'SEQ_x"));
        assert!(!is_nonterminal_reference("\"it's quoted\""));
        assert!(!is_nonterminal_reference("\"plain\""));
    }

    #[test]
    fn terminal_unescaping() {
        assert_eq!(unescape_terminal("\"abc\""), "abc");
        assert_eq!(unescape_terminal("\"a\\\"b\""), "a\"b");
        assert_eq!(unescape_terminal("\\x41"), "A");
        assert_eq!(unescape_terminal("\"\\x0a\""), "\n");
    }

    #[test]
    fn grammar_block_spans_lines() {
        let text = "// prelude\nGrammar(\n  'start := 'a,\n  'a := \"x\" ,\n)\ntrailing";
        let block = extract_grammar_block(text).unwrap();
        let rules = split_rules(&block);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].symbol, "'start");
        assert_eq!(rules[1].derivation, "\"x\"");
    }

    #[test]
    fn nested_parens_in_rules_balance() {
        let text = "Grammar('start:=\"(\" ~ 'a ~ \")\",'a:=\"x\")";
        let block = extract_grammar_block(text).unwrap();
        assert_eq!(split_rules(&block).len(), 2);
    }

    #[test]
    fn unbalanced_block_is_rejected() {
        assert!(extract_grammar_block("Grammar( 'start := \"a\",").is_none());
        assert!(extract_grammar_block("no grammar here").is_none());
    }

    #[test]
    fn sequence_symbols_are_flagged() {
        let rules = split_rules("'start := 'SEQ_x, 'SEQ_x := \"x\"");
        assert!(!rules[0].sequence);
        assert!(rules[1].sequence);
    }
}

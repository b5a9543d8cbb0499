use proptest::prelude::*;
use txscript_core::lexer::{tokenize, TokenKind};
use txscript_core::parser::{parse, parse_source};
use txscript_core::{ErrorKind, Phase};

#[test]
fn hex_literal_is_one_token() {
    let (tokens, errors) = tokenize("0x7DF");
    assert!(errors.is_empty());
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0].kind, TokenKind::HexNumber);
    assert_eq!(tokens[0].text, "0x7DF");
    assert_eq!(tokens[1].kind, TokenKind::Eof);
}

#[test]
fn unterminated_string_still_ends_in_eof() {
    let (tokens, errors) = tokenize("print \"abc");
    assert!(errors.iter().any(|e| e.phase == Phase::Lex && e.kind == ErrorKind::UnterminatedString));
    assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::Eof));
}

#[test]
fn every_error_in_a_script_is_reported() {
    let source = "var = 1\nsend(0x1, @)\nrepeat(2) { print \"ok\" }\ndelay(\nprint \"unterminated";
    let (program, errors) = parse_source(source);
    assert!(errors.len() >= 4, "{:#?}", errors);
    assert!(errors.iter().any(|e| e.phase == Phase::Lex));
    assert!(errors.iter().any(|e| e.phase == Phase::Parse));
    assert!(errors.iter().any(|e| e.line == 1));
    assert!(errors.iter().any(|e| e.line == 2));
    assert!(errors.iter().any(|e| e.line == 5));
    assert!(!program.statements.is_empty());
}

fn script_fragment() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "var x = 1", "send(0x7DF, 0x02, 0x01)", "delay(10)", "repeat(2) {", "loop {", "}", "{",
        "if (x > 1)", "else", "wait_for(id == 0x7E8) timeout(5s)", "on_receive(id == 1) {",
        "on_interval(100) {", "function f(a) {", "return a", "break", "continue", "print x",
        "x += 1", ";", "\n", "(", ")", "[1, 2", "\"str", "/* c", "0x", "1.", "?", ":", "ext",
    ])
    .prop_map(str::to_string)
}

proptest! {
    #[test]
    fn tokenize_always_ends_in_eof(s in "\\PC*") {
        let (tokens, _) = tokenize(&s);
        prop_assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::Eof));
        prop_assert_eq!(tokens.iter().filter(|t| t.kind == TokenKind::Eof).count(), 1);
    }

    #[test]
    fn token_positions_are_one_based(s in "\\PC*") {
        let (tokens, errors) = tokenize(&s);
        prop_assert!(tokens.iter().all(|t| t.line >= 1 && t.column >= 1));
        prop_assert!(errors.iter().all(|e| e.line >= 1 && e.column >= 1));
    }

    #[test]
    fn parser_is_total_on_arbitrary_text(s in "\\PC*") {
        let (tokens, _) = tokenize(&s);
        let (_, errors) = parse(tokens);
        prop_assert!(errors.iter().all(|e| e.phase == Phase::Parse));
    }

    #[test]
    fn parser_is_total_on_script_like_input(parts in prop::collection::vec(script_fragment(), 0..40)) {
        let source = parts.join(" ");
        let (_, errors) = parse_source(&source);
        prop_assert!(errors.iter().all(|e| e.line >= 1));
    }
}

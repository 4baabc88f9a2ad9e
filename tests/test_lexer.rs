use std::sync::Arc;

use forge::lexer::{Lexer, LexerError, Token};
use forge::strings::StringTable;

fn tokenize(input: &str) -> Vec<Token> {
    let strings = Arc::new(StringTable::new());
    Lexer::new(input, strings).tokenize().unwrap()
}

fn tokenize_with(input: &str, strings: Arc<StringTable>) -> Result<Vec<Token>, LexerError> {
    Lexer::new(input, strings).tokenize()
}

#[test]
fn test_words_and_numbers() {
    let tokens = tokenize("16 dup + -42");
    assert_eq!(
        tokens,
        vec![
            Token::Integer(16),
            Token::Word("dup".to_string()),
            Token::Word("+".to_string()),
            Token::Integer(-42),
            Token::End,
        ]
    );
}

#[test]
fn test_hex_and_binary_literals() {
    let tokens = tokenize("0x10 0XFF 0b101 0B11");
    assert_eq!(
        tokens,
        vec![
            Token::Integer(16),
            Token::Integer(255),
            Token::Integer(5),
            Token::Integer(3),
            Token::End,
        ]
    );
}

#[test]
fn test_hex_parses_unsigned() {
    let tokens = tokenize("0xffffffffffffffff");
    assert_eq!(tokens[0], Token::Integer(-1));
}

#[test]
fn test_float_literals() {
    let tokens = tokenize("2.5 -0.5 1e3 2.5e-2");
    assert_eq!(
        tokens,
        vec![
            Token::Float(2.5),
            Token::Float(-0.5),
            Token::Float(1000.0),
            Token::Float(0.025),
            Token::End,
        ]
    );
}

#[test]
fn test_number_like_words_stay_words() {
    // 1+, 2*, 8/ and friends are words, not malformed numbers.
    let tokens = tokenize("1+ 2* 8/ 16-");
    for token in &tokens[..4] {
        assert!(matches!(token, Token::Word(_)), "got {:?}", token);
    }
}

#[test]
fn test_mode_switch_tokens() {
    let tokens = tokenize(": ; [ ]");
    assert_eq!(
        tokens,
        vec![
            Token::Compiling(':'),
            Token::Interpreting(';'),
            Token::Interpreting('['),
            Token::Compiling(']'),
            Token::End,
        ]
    );
}

#[test]
fn test_paren_comments_removed() {
    let tokens = tokenize("1 ( this is a comment ) 2 ( nested ( inner ) still ) 3");
    assert_eq!(
        tokens,
        vec![
            Token::Integer(1),
            Token::Integer(2),
            Token::Integer(3),
            Token::End,
        ]
    );
}

#[test]
fn test_unterminated_comment() {
    let strings = Arc::new(StringTable::new());
    let result = tokenize_with("1 ( runs off the end", strings);
    assert_eq!(result, Err(LexerError::UnterminatedComment));
}

#[test]
fn test_string_literal_is_interned() {
    let strings = Arc::new(StringTable::new());
    let tokens = tokenize_with(".\" hello world\"", strings.clone()).unwrap();

    assert_eq!(tokens[0], Token::Word(".\"".to_string()));
    match &tokens[1] {
        Token::Str { index, addr } => {
            assert_eq!(strings.get(*index).unwrap(), "hello world");
            assert_eq!(strings.address(*index).unwrap() as u64, *addr);
            // the observable wire form carries the address
            assert_eq!(tokens[1].to_string(), format!("sPtr_{}", addr));
        }
        other => panic!("expected a string token, got {:?}", other),
    }
}

#[test]
fn test_s_quote_literal() {
    let strings = Arc::new(StringTable::new());
    let tokens = tokenize_with("s\" abc\" s.", strings.clone()).unwrap();
    assert_eq!(tokens[0], Token::Word("s\"".to_string()));
    assert!(matches!(tokens[1], Token::Str { .. }));
    assert_eq!(tokens[2], Token::Word("s.".to_string()));
}

#[test]
fn test_unterminated_string() {
    let strings = Arc::new(StringTable::new());
    let result = tokenize_with(".\" no closing quote", strings);
    assert_eq!(result, Err(LexerError::UnterminatedString));
}

#[test]
fn test_same_literal_same_index() {
    let strings = Arc::new(StringTable::new());
    let a = tokenize_with("s\" dup\"", strings.clone()).unwrap();
    let b = tokenize_with("s\" dup\"", strings).unwrap();
    let (ia, ib) = match (&a[1], &b[1]) {
        (Token::Str { index: ia, .. }, Token::Str { index: ib, .. }) => (*ia, *ib),
        _ => panic!("expected string tokens"),
    };
    assert_eq!(ia, ib);
}

#[test]
fn test_definition_stream() {
    let tokens = tokenize(": square dup * ;");
    assert_eq!(tokens[0], Token::Compiling(':'));
    assert_eq!(tokens[1], Token::Word("square".to_string()));
    assert_eq!(tokens[4], Token::Interpreting(';'));
}

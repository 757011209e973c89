pub mod error;
pub mod lexer;
pub mod token;

pub use error::LexError;
pub use lexer::Lexer;
pub use token::{Span, Token, TokenKind};

/// Scans the whole source eagerly into a token vector, terminated by `Eof`.
/// The compiler normally drives a `Lexer` token-by-token instead; this is
/// convenient for tests and tools that want the full stream up front.
pub fn tokenize(source: &str) -> Vec<Token<'_>> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let tok = lexer.next_token();
        let done = tok.kind == TokenKind::Eof;
        tokens.push(tok);
        if done {
            break;
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn number_literals() {
        assert_eq!(
            kinds("1 2.5 0"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Number(2.5),
                TokenKind::Number(0.0),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn string_literal_with_escapes() {
        let toks = tokenize(r#""a\nb""#);
        assert_eq!(toks[0].kind, TokenKind::String("a\nb".to_string()));
    }

    #[test]
    fn string_spans_newlines_and_tracks_line() {
        let toks = tokenize("\"a\nb\";\nvar");
        assert_eq!(toks[0].kind, TokenKind::String("a\nb".to_string()));
        let var_tok = toks.iter().find(|t| t.kind == TokenKind::Var).unwrap();
        assert_eq!(var_tok.line(), 3);
    }

    #[test]
    fn unterminated_string_is_error_token() {
        let toks = tokenize("\"abc");
        match &toks[0].kind {
            TokenKind::Error(msg) => assert!(msg.contains("unterminated")),
            other => panic!("expected error token, got {:?}", other),
        }
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("class fox extends Animal"),
            vec![
                TokenKind::Class,
                TokenKind::Identifier,
                TokenKind::Extends,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn double_character_operators() {
        assert_eq!(
            kinds("== != <= >= && || << >> >>> ++ -- -> <- .. ... |>"),
            vec![
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::ShiftLeft,
                TokenKind::ShiftRight,
                TokenKind::UnsignedShiftRight,
                TokenKind::PlusPlus,
                TokenKind::MinusMinus,
                TokenKind::Arrow,
                TokenKind::LeftArrow,
                TokenKind::DotDot,
                TokenKind::DotDotDot,
                TokenKind::PipeArrow,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn compound_assignment_forms() {
        assert_eq!(
            kinds("+= -= *= /= %= &= |= ^= <<= >>= >>>="),
            vec![
                TokenKind::PlusEqual,
                TokenKind::MinusEqual,
                TokenKind::StarEqual,
                TokenKind::SlashEqual,
                TokenKind::PercentEqual,
                TokenKind::AmpEqual,
                TokenKind::PipeEqual,
                TokenKind::CaretEqual,
                TokenKind::ShiftLeftEqual,
                TokenKind::ShiftRightEqual,
                TokenKind::UnsignedShiftRightEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn line_and_block_comments_are_skipped() {
        assert_eq!(
            kinds("1 // trailing comment\n/* block\ncomment */ 2"),
            vec![TokenKind::Number(1.0), TokenKind::Number(2.0), TokenKind::Eof]
        );
    }

    #[test]
    fn unexpected_byte_is_error_token() {
        let toks = tokenize("@");
        match &toks[0].kind {
            TokenKind::Error(msg) => assert!(msg.contains("unexpected")),
            other => panic!("expected error token, got {:?}", other),
        }
    }
}

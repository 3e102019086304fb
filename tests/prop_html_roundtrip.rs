// Property: lexing a document in arbitrary chunks and serializing the
// unmodified tokens reproduces the input byte for byte.

use pingora_pagespeed::html::{serialize, Lexer};
use proptest::prelude::*;

fn html_fragment() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            Just("<p>".to_string()),
            Just("</p>".to_string()),
            Just("<img src=a.png alt='x y'>".to_string()),
            Just("<link rel=stylesheet href=\"b.css\"/>".to_string()),
            Just("<script>if (a < b) { x = '</scr'; }</script>".to_string()),
            Just("<style>p{color:red}</style>".to_string()),
            Just("<!-- note -->".to_string()),
            Just("<!DOCTYPE html>".to_string()),
            Just("<?xml version=\"1.0\"?>".to_string()),
            Just("<".to_string()),
            Just("</".to_string()),
            Just("<div".to_string()),
            Just(" a=\"".to_string()),
            Just(">".to_string()),
            "[a-z <>/=\"'!-]{0,12}",
        ],
        0..24,
    )
    .prop_map(|parts| parts.concat())
}

fn lex_in_chunks(input: &[u8], cuts: &[usize]) -> Vec<u8> {
    let mut lexer = Lexer::new();
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (input.len() + 1)).collect();
    points.sort_unstable();
    for point in points {
        lexer.feed(&input[start..point], &mut tokens);
        start = point;
    }
    lexer.feed(&input[start..], &mut tokens);
    lexer.finish(&mut tokens);
    serialize(&tokens)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Unmodified markup survives any chunking
    #[test]
    fn prop_markup_round_trips(
        html in html_fragment(),
        cuts in prop::collection::vec(any::<usize>(), 0..6),
    ) {
        let output = lex_in_chunks(html.as_bytes(), &cuts);
        prop_assert_eq!(output, html.as_bytes().to_vec());
    }

    /// Arbitrary bytes, including invalid UTF-8, survive as well
    #[test]
    fn prop_arbitrary_bytes_round_trip(
        input in prop::collection::vec(any::<u8>(), 0..512),
        cuts in prop::collection::vec(any::<usize>(), 0..6),
    ) {
        let output = lex_in_chunks(&input, &cuts);
        prop_assert_eq!(output, input);
    }
}

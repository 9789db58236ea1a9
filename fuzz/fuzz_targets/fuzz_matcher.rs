#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use meshgrep::grep::{ContextLines, LineMatcher};

#[derive(Arbitrary, Debug)]
struct Input<'a> {
    pattern: &'a str,
    content: &'a [u8],
    ignore_case: bool,
    before: u8,
    after: u8,
}

fuzz_target!(|input: Input| {
    let Ok(matcher) = LineMatcher::new(input.pattern, input.ignore_case) else {
        return;
    };
    let context = ContextLines {
        before: (input.before % 8) as usize,
        after: (input.after % 8) as usize,
    };
    if let Ok(found) = matcher.grep_reader(input.content, context) {
        assert!(found.num_matches as usize <= found.lines.len());
    }
});

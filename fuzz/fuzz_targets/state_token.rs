#![no_main]

use libfuzzer_sys::fuzz_target;
use refnotes_core::model::ChangeId;
use refnotes_core::token::StateToken;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(Some(token)) = StateToken::parse(ChangeId::new(1), Some(text)) {
        let reparsed = StateToken::parse(ChangeId::new(1), Some(&token.to_string()));
        assert_eq!(reparsed.ok().flatten(), Some(token));
    }
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use refnotes_core::model::ChangeId;
use refnotes_core::note::{CommitMessage, MessageBuilder};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(parsed) = CommitMessage::parse(ChangeId::new(1), text) else {
        return;
    };

    // Whatever parses must survive being written out and read again.
    let mut builder = MessageBuilder::new(&parsed.subject).body(parsed.body.as_deref());
    for footer in &parsed.footers {
        builder.push(footer.key, &footer.value);
    }
    let _ = CommitMessage::parse(ChangeId::new(1), &builder.build());
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use refnotes_core::config::IdentityConfig;
use refnotes_core::model::ChangeId;
use refnotes_core::note::{IdentityCodec, RevisionNote};

fuzz_target!(|data: &[u8]| {
    let codec = IdentityCodec::new(&IdentityConfig::default());
    let Ok(note) = RevisionNote::decode(ChangeId::new(1), data, &codec) else {
        return;
    };
    if let Some(bytes) = note.encode(&codec) {
        let again = RevisionNote::decode(ChangeId::new(1), &bytes, &codec);
        assert!(again.is_ok(), "re-encoded note failed to decode");
    }
});

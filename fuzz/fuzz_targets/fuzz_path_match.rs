//! Fuzz target for glob and subpath matching.
//!
//! Matching must never panic on arbitrary patterns, and a database must
//! agree with itself: whatever routes must route the same way when the
//! absolute prefix is added.

#![no_main]

use libfuzzer_sys::fuzz_target;
use treemesh::database::TreeDatabase;
use treemesh::path::{glob_match, is_wildcard, path_depth, session_relative};

fuzz_target!(|data: (&str, &str)| {
    let (pattern, text) = data;

    // Should never panic, whatever the inputs.
    let _ = glob_match(pattern, text);
    let _ = is_wildcard(pattern);
    let _ = path_depth(text);
    let _ = session_relative(text);

    // A pattern with no metacharacters behaves like equality.
    if !is_wildcard(pattern) {
        assert_eq!(glob_match(pattern, pattern), true);
    }

    // Routing never panics and is consistent with the absolute form.
    if !text.starts_with('/') {
        let db = TreeDatabase::new(0, "dbs/db_0");
        let relative = db.database_subpath(text);
        let absolute = db.database_subpath(&format!("/zg/0/{text}"));
        assert_eq!(relative, absolute);
    }
});

//! Static rejection of source containing a blacklisted import. Textual only:
//! it does not reason about transitive imports, build constraints, or
//! reflection, and is evaded by e.g. `//go:linkname`, assembly, or cgo if the
//! outer runner permits them — it is the first gate, not the last.

/// Forbidden-import denylist: process execution, direct syscalls, unsafe
/// memory operations, raw network, raw HTTP, dynamic plugins.
const BLACKLIST: &[&str] = &[
	"os/exec",
	"syscall",
	"unsafe",
	"net",
	"net/http",
	"plugin",
];

/// Returns the first blacklisted import name found in `source`, if any.
/// Handles both block (`import ( ... )`) and single (`import "..."`) import
/// forms. Matching is byte-exact against the denylist; no aliasing, no
/// wildcard paths. Pure function of `source`: repeated calls on the same
/// input return identical results.
pub fn find_blacklisted_import(source: &str) -> Option<&'static str> {
	for entry in import_entries(source) {
		if let Some(&hit) = BLACKLIST.iter().find(|&&b| b == entry) {
			return Some(hit);
		}
	}
	None
}

pub fn contains_blacklisted_import(source: &str) -> bool {
	find_blacklisted_import(source).is_some()
}

/// Yields each individual import path token in `source`, whether declared in
/// a block form or a single-line form.
fn import_entries(source: &str) -> impl Iterator<Item = String> + '_ {
	let mut entries = Vec::new();
	let mut lines = source.lines().peekable();
	while let Some(line) = lines.next() {
		let trimmed = strip_comment(line).trim();
		let Some(rest) = trimmed.strip_prefix("import") else {
			continue;
		};
		let rest = rest.trim_start();
		if let Some(block) = rest.strip_prefix('(') {
			// Single-line block: `import ( "a" "b" )`.
			if let Some(end) = block.find(')') {
				for tok in block[..end].split_whitespace() {
					if let Some(path) = unquote(tok) {
						entries.push(path);
					}
				}
				continue;
			}
			// Multi-line block: consume until the closing paren.
			for entry_line in lines.by_ref() {
				let entry_line = strip_comment(entry_line).trim();
				if entry_line.starts_with(')') {
					break;
				}
				if let Some(path) = parse_import_line(entry_line) {
					entries.push(path);
				}
			}
		} else if let Some(path) = parse_import_line(rest) {
			entries.push(path);
		}
	}
	entries.into_iter()
}

/// Parses a single import-declaration line, which may carry an optional
/// alias or dot/blank import before the quoted path: `alias "path"`.
fn parse_import_line(line: &str) -> Option<String> {
	let line = line.trim();
	if line.is_empty() {
		return None;
	}
	// Take the last whitespace-separated token, which is always the quoted
	// path regardless of whether an alias precedes it.
	let token = line.rsplit(char::is_whitespace).next().unwrap_or(line);
	unquote(token)
}

fn strip_comment(line: &str) -> &str {
	match line.find("//") {
		Some(idx) => &line[..idx],
		None => line,
	}
}

fn unquote(token: &str) -> Option<String> {
	let token = token.trim();
	let token = token.strip_prefix('"')?;
	let token = token.strip_suffix('"')?;
	Some(token.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn single_form_hit() {
		let src = "package main\nimport \"os/exec\"\nfunc main(){}";
		assert_eq!(find_blacklisted_import(src), Some("os/exec"));
	}

	#[test]
	fn single_form_miss() {
		let src = "package main\nimport \"fmt\"\nfunc main(){}";
		assert_eq!(find_blacklisted_import(src), None);
	}

	#[test]
	fn block_form_multiline_hit() {
		let src = "package main\nimport (\n\t\"fmt\"\n\t\"net\"\n)\nfunc main(){}";
		assert_eq!(find_blacklisted_import(src), Some("net"));
	}

	#[test]
	fn block_form_single_line_hit() {
		let src = "package main\nimport ( \"fmt\" \"syscall\" )\nfunc main(){}";
		assert_eq!(find_blacklisted_import(src), Some("syscall"));
	}

	#[test]
	fn strips_inline_comments_and_whitespace() {
		let src = "package main\nimport (\n\t\"os/exec\" // shells out\n)\n";
		assert_eq!(find_blacklisted_import(src), Some("os/exec"));
	}

	#[test]
	fn respects_aliased_imports() {
		let src = "package main\nimport (\n\tx \"net/http\"\n)\n";
		assert_eq!(find_blacklisted_import(src), Some("net/http"));
	}

	#[test]
	fn no_aliasing_or_substring_match() {
		// "net/http/httptest" is not byte-exact-equal to any denylist entry.
		let src = "package main\nimport \"net/http/httptest\"\n";
		assert_eq!(find_blacklisted_import(src), None);
	}

	#[test]
	fn idempotent() {
		let src = "package main\nimport \"os/exec\"\n";
		assert_eq!(find_blacklisted_import(src), find_blacklisted_import(src));
	}

	#[test]
	fn empty_source_is_safe() {
		assert_eq!(find_blacklisted_import(""), None);
	}
}

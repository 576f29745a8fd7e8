//! String formatting utilities.

/// Truncates an identifier for display in logs.
///
/// Shows only the first 8 characters followed by ".." for longer strings.
pub fn truncate_id(id: &str) -> String {
	match id.char_indices().nth(8) {
		Some((cut, _)) => format!("{}..", &id[..cut]),
		None => id.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_truncate_id() {
		assert_eq!(truncate_id("1002"), "1002");
		assert_eq!(truncate_id("12345678"), "12345678");
		assert_eq!(
			truncate_id("5f0c2a9e-8d1b-4c7e-9a3f-0b6d2e1c4f5a"),
			"5f0c2a9e.."
		);
	}
}

use regex::Regex;
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::sync::OnceLock;
use tracing::warn;

/// The SQL dialects understood by the worklist data source.
///
/// Deployed query templates are written for Oracle; the other dialects receive
/// a best-effort rewrite of the template before execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
	Oracle,
	#[serde(alias = "postgresql")]
	Postgres,
	MySql,
}

impl Display for SqlDialect {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Oracle => write!(f, "Oracle"),
			Self::Postgres => write!(f, "PostgreSQL"),
			Self::MySql => write!(f, "MySQL"),
		}
	}
}

impl SqlDialect {
	pub const fn default_port(self) -> u16 {
		match self {
			Self::Oracle => 1521,
			Self::Postgres => 5432,
			Self::MySql => 3306,
		}
	}

	/// Rewrites the configured Oracle-flavored query for this dialect.
	///
	/// This is not a SQL transpiler. Only a fixed set of substring patterns
	/// observed in deployed query templates is recognized: `TO_CHAR` with the
	/// `YYYYMMDD`/`HH24MISS` format masks and `DECODE` over plain string
	/// literals. Anything else passes through unmodified.
	pub fn translate(self, query: &str) -> String {
		match self {
			Self::Oracle => query.to_owned(),
			Self::Postgres => {
				// TO_CHAR is native to Postgres; only DECODE needs a rewrite.
				let translated = translate_decode(query);
				warn_untranslated(self, &translated, &[decode_call_pattern()]);
				translated
			}
			Self::MySql => {
				let translated = translate_decode(&translate_to_char(query));
				warn_untranslated(
					self,
					&translated,
					&[decode_call_pattern(), to_char_call_pattern()],
				);
				translated
			}
		}
	}
}

fn to_char_date_pattern() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| {
		Regex::new(r"(?i)TO_CHAR\(\s*([A-Za-z_][A-Za-z0-9_.]*)\s*,\s*'YYYYMMDD'\s*\)")
			.expect("pattern is valid")
	})
}

fn to_char_time_pattern() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| {
		Regex::new(r"(?i)TO_CHAR\(\s*([A-Za-z_][A-Za-z0-9_.]*)\s*,\s*'HH24MISS'\s*\)")
			.expect("pattern is valid")
	})
}

fn decode_pattern() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| {
		Regex::new(r"(?i)DECODE\(\s*([A-Za-z_][A-Za-z0-9_.]*)\s*,\s*('[^']*'(?:\s*,\s*'[^']*')*)\s*\)")
			.expect("pattern is valid")
	})
}

fn string_literal_pattern() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| Regex::new(r"'([^']*)'").expect("pattern is valid"))
}

fn to_char_call_pattern() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| Regex::new(r"(?i)TO_CHAR\(").expect("pattern is valid"))
}

fn decode_call_pattern() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| Regex::new(r"(?i)DECODE\(").expect("pattern is valid"))
}

/// `TO_CHAR(expr, 'YYYYMMDD'|'HH24MISS')` to the `DATE_FORMAT` equivalent.
fn translate_to_char(query: &str) -> String {
	let query = to_char_date_pattern().replace_all(query, "DATE_FORMAT($1, '%Y%m%d')");
	let query = to_char_time_pattern().replace_all(&query, "DATE_FORMAT($1, '%H%i%s')");
	query.into_owned()
}

/// `DECODE(expr, 'a', 'A', ..., ['default'])` to a `CASE` expression.
fn translate_decode(query: &str) -> String {
	decode_pattern()
		.replace_all(query, |captures: &regex::Captures<'_>| {
			let column = &captures[1];
			let literals: Vec<&str> = string_literal_pattern()
				.captures_iter(&captures[2])
				.map(|c| c.get(1).map_or("", |m| m.as_str()))
				.collect();

			let mut case = String::from("CASE");
			let mut chunks = literals.chunks_exact(2);
			for pair in chunks.by_ref() {
				case.push_str(&format!(" WHEN {column} = '{}' THEN '{}'", pair[0], pair[1]));
			}
			let default = chunks.remainder().first().copied().unwrap_or("");
			case.push_str(&format!(" ELSE '{default}' END"));
			case
		})
		.into_owned()
}

fn warn_untranslated(dialect: SqlDialect, query: &str, leftovers: &[&Regex]) {
	for pattern in leftovers {
		if pattern.is_match(query) {
			warn!(
				%dialect,
				"query still contains {} constructs that could not be translated; \
				 they are passed to the database unmodified",
				pattern.as_str().trim_start_matches("(?i)").trim_end_matches("\\(")
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn oracle_passes_through_unchanged() {
		let query = "SELECT TO_CHAR(t.dt, 'YYYYMMDD'), decode(t.x,'U','URGENCIA') FROM t";
		assert_eq!(SqlDialect::Oracle.translate(query), query);
	}

	#[test]
	fn mysql_rewrites_date_and_time_masks() {
		let query = "SELECT TO_CHAR(paciente.dt_nascimento, 'YYYYMMDD'), \
		             TO_CHAR(ped_rx.hr_pedido, 'HH24MISS') FROM ped_rx";
		assert_eq!(
			SqlDialect::MySql.translate(query),
			"SELECT DATE_FORMAT(paciente.dt_nascimento, '%Y%m%d'), \
			 DATE_FORMAT(ped_rx.hr_pedido, '%H%i%s') FROM ped_rx"
		);
	}

	#[test]
	fn mysql_rewrite_is_case_insensitive() {
		assert_eq!(
			SqlDialect::MySql.translate("to_char(x.dt, 'YYYYMMDD')"),
			"DATE_FORMAT(x.dt, '%Y%m%d')"
		);
	}

	#[test]
	fn decode_becomes_case_expression() {
		let query = "decode(atendime.tp_atendimento,'U', 'URGENCIA', 'I', 'INTERNACAO', 'A', 'AMBULATORIO')";
		let expected = "CASE WHEN atendime.tp_atendimento = 'U' THEN 'URGENCIA' \
		                WHEN atendime.tp_atendimento = 'I' THEN 'INTERNACAO' \
		                WHEN atendime.tp_atendimento = 'A' THEN 'AMBULATORIO' ELSE '' END";
		assert_eq!(
			SqlDialect::Postgres.translate(query),
			expected.split_whitespace().collect::<Vec<_>>().join(" ")
		);
		assert_eq!(
			SqlDialect::MySql.translate(query),
			expected.split_whitespace().collect::<Vec<_>>().join(" ")
		);
	}

	#[test]
	fn decode_with_default_keeps_the_default() {
		assert_eq!(
			SqlDialect::Postgres.translate("DECODE(t.x, 'A', 'APPLE', 'OTHER')"),
			"CASE WHEN t.x = 'A' THEN 'APPLE' ELSE 'OTHER' END"
		);
	}

	#[test]
	fn unknown_constructs_pass_through() {
		// DECODE over column arguments is outside the recognized pattern set.
		let query = "SELECT DECODE(t.x, t.y, t.z) FROM t";
		assert_eq!(SqlDialect::Postgres.translate(query), query);

		let query = "SELECT TO_CHAR(t.dt, 'DD-MON-YYYY') FROM t";
		assert_eq!(SqlDialect::MySql.translate(query), query);
	}

	#[test]
	fn postgres_keeps_to_char() {
		let query = "SELECT TO_CHAR(t.dt, 'YYYYMMDD') FROM t";
		assert_eq!(SqlDialect::Postgres.translate(query), query);
	}
}

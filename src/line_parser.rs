use crate::nut_status::status_code;

pub(crate) const STATUS_FIELD: &str = "ups.status";

/// One `field: value` line as printed by upsc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample<'a> {
	pub field: &'a str,
	pub raw_value: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Parsed {
	Value(f64),
	Dropped,
}

/// Splits on the first `": "`, so a value may itself contain the separator.
pub fn split_line(line: &str) -> Option<RawSample<'_>> {
	match line.split_once(": ") {
		Some((_, "")) | None => None,
		Some((field, raw_value)) => Some(RawSample { field, raw_value }),
	}
}

impl RawSample<'_> {
	pub fn parse(&self) -> Parsed {
		if self.field == STATUS_FIELD {
			// Unknown status tokens leave the previously exported status untouched.
			return status_code(self.raw_value).map_or(Parsed::Dropped, |code| Parsed::Value(code.into()));
		}
		self.raw_value.parse::<f64>().map_or(Parsed::Dropped, Parsed::Value)
	}
}

#[cfg(test)]
mod tests {
	use std::{fs, path::PathBuf};

	use insta::assert_debug_snapshot;
	use rstest::rstest;

	use super::{split_line, Parsed, RawSample, STATUS_FIELD};

	fn parse(line: &str) -> Option<(&str, Parsed)> {
		split_line(line).map(|s| (s.field, s.parse()))
	}

	#[rstest]
	#[case("ups.status: OL", Some(("ups.status", Parsed::Value(3.))))]
	#[case("ups.status: OB", Some(("ups.status", Parsed::Value(4.))))]
	#[case("ups.status: OL CHRG", Some(("ups.status", Parsed::Dropped)))]
	#[case("battery.charge: 95.5", Some(("battery.charge", Parsed::Value(95.5))))]
	#[case("input.voltage: 230.0", Some(("input.voltage", Parsed::Value(230.))))]
	#[case("device.mfr: EATON", Some(("device.mfr", Parsed::Dropped)))]
	#[case("battery.charge:95", None)]
	#[case("battery.charge: ", None)]
	#[case("", None)]
	#[case("Init SSL without certificate database", None)]
	fn single_lines(#[case] line: &str, #[case] expected: Option<(&str, Parsed)>) {
		assert_eq!(parse(line), expected);
	}

	#[test]
	fn splits_on_first_separator_only() {
		assert_eq!(
			split_line("ups.test.result: Done: passed"),
			Some(RawSample {
				field: "ups.test.result",
				raw_value: "Done: passed",
			})
		);
	}

	#[test]
	fn parses_upsc_dump() {
		let dump = "battery.charge: 95.5\nbattery.type: PbAc\ndevice.mfr: EATON\ninput.voltage: 230.0\nups.status: OL\nups.delay.shutdown: 20\n";
		let parsed: Vec<_> = dump.lines().filter_map(parse).collect();
		assert_debug_snapshot!(parsed, @r#"
		[
		    (
		        "battery.charge",
		        Value(
		            95.5,
		        ),
		    ),
		    (
		        "battery.type",
		        Dropped,
		    ),
		    (
		        "device.mfr",
		        Dropped,
		    ),
		    (
		        "input.voltage",
		        Value(
		            230.0,
		        ),
		    ),
		    (
		        "ups.status",
		        Value(
		            3.0,
		        ),
		    ),
		    (
		        "ups.delay.shutdown",
		        Value(
		            20.0,
		        ),
		    ),
		]
		"#);
	}

	#[rstest]
	fn upsc_examples(#[files("tests/upsc_examples/*.status")] path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
		let dump = fs::read_to_string(&path)?;
		let samples: Vec<_> = dump.lines().filter_map(split_line).collect();
		assert!(!samples.is_empty(), "{} has no samples", path.display());
		let status = samples.iter().find(|s| s.field == STATUS_FIELD).ok_or("no ups.status line")?;
		let numeric = samples.iter().filter(|s| matches!(s.parse(), Parsed::Value(_))).count();
		assert!(numeric > 0, "{} has no numeric fields", path.display());
		// Multi-flag statuses are dropped, single flags map to a code.
		match status.parse() {
			Parsed::Value(code) => assert!((0. ..12.).contains(&code)),
			Parsed::Dropped => assert!(status.raw_value.contains(' '), "unexpected status {}", status.raw_value),
		}
		Ok(())
	}
}

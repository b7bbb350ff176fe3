// Adapted from the NUT ups.status flag list (docs/new-drivers.txt)

/// Codes exported for `ups.status`, in NUT's documented order.
pub(crate) const STATUS_CODES: [(&str, u8); 12] = [
	("CAL", 0),
	("TRIM", 1),
	("BOOST", 2),
	("OL", 3),
	("OB", 4),
	("OVER", 5),
	("LB", 6),
	("RB", 7),
	("BYPASS", 8),
	("OFF", 9),
	("CHRG", 10),
	("DISCHRG", 11),
];

pub(crate) fn status_code(token: &str) -> Option<u8> {
	STATUS_CODES.iter().find(|(t, _)| *t == token).map(|(_, code)| *code)
}

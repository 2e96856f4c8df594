//! `Accept` header negotiation.

use mime::Mime;

/// Parsed `Accept` header, ordered by preference.
///
/// ```rust
/// use fulcrum::Accepts;
///
/// let accepts = Accepts::parse(Some("text/html;q=0.9, application/json"));
/// assert_eq!(accepts.negotiate(&["text/html", "application/json"]), Some("application/json"));
/// ```
#[derive(Clone, Debug)]
pub struct Accepts {
    ranges: Vec<(Mime, f32)>,
}

impl Accepts {
    /// A missing header accepts anything. Unparseable ranges are skipped.
    pub fn parse(header: Option<&str>) -> Self {
        let Some(header) = header else {
            return Self { ranges: vec![(mime::STAR_STAR, 1.0)] };
        };
        let mut ranges: Vec<(Mime, f32)> = header
            .split(',')
            .filter_map(|part| part.trim().parse::<Mime>().ok())
            .map(|m| {
                let q = m
                    .get_param("q")
                    .and_then(|q| q.as_str().parse::<f32>().ok())
                    .unwrap_or(1.0);
                (m, q)
            })
            .filter(|(_, q)| *q > 0.0)
            .collect();
        // Stable: equal weights keep header order.
        ranges.sort_by(|a, b| b.1.total_cmp(&a.1));
        Self { ranges }
    }

    /// Media ranges in preference order, without parameters.
    pub fn types(&self) -> Vec<String> {
        self.ranges.iter().map(|(m, _)| m.essence_str().to_owned()).collect()
    }

    /// The most preferred of `offered`, if any is acceptable.
    pub fn negotiate<'a>(&self, offered: &[&'a str]) -> Option<&'a str> {
        let offered: Vec<(&'a str, Mime)> = offered
            .iter()
            .filter_map(|o| o.parse::<Mime>().ok().map(|m| (*o, m)))
            .collect();
        self.ranges.iter().find_map(|(range, _)| {
            offered
                .iter()
                .find(|(_, m)| matches_range(range, m))
                .map(|(o, _)| *o)
        })
    }
}

fn matches_range(range: &Mime, candidate: &Mime) -> bool {
    let type_ok = range.type_() == mime::STAR || range.type_() == candidate.type_();
    let subtype_ok = range.subtype() == mime::STAR || range.subtype() == candidate.subtype();
    type_ok && subtype_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_header_accepts_the_first_offer() {
        let accepts = Accepts::parse(None);
        assert_eq!(accepts.negotiate(&["application/json", "text/html"]), Some("application/json"));
    }

    #[test]
    fn weights_order_preferences() {
        let accepts = Accepts::parse(Some("text/*;q=0.5, application/json;q=0.8"));
        assert_eq!(accepts.types(), vec!["application/json", "text/*"]);
        assert_eq!(accepts.negotiate(&["text/html"]), Some("text/html"));
        assert_eq!(accepts.negotiate(&["image/png"]), None);
    }

    #[test]
    fn zero_weight_is_refused() {
        let accepts = Accepts::parse(Some("text/html;q=0"));
        assert_eq!(accepts.negotiate(&["text/html"]), None);
    }
}

//! Model-year ranges per model family. Spans of one model never overlap.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSpan {
    pub model: &'static str,
    pub generation: &'static str,
    pub from: i32,
    pub to: Option<i32>,
}

impl GenerationSpan {
    pub fn contains(&self, year: i32) -> bool {
        year >= self.from && self.to.map_or(true, |to| year <= to)
    }

    /// "991.2" -> "991"
    pub fn family(&self) -> &'static str {
        self.generation
            .split_once('.')
            .map(|(family, _)| family)
            .unwrap_or(self.generation)
    }
}

const fn span(
    model: &'static str,
    generation: &'static str,
    from: i32,
    to: Option<i32>,
) -> GenerationSpan {
    GenerationSpan {
        model,
        generation,
        from,
        to,
    }
}

pub const GENERATIONS: &[GenerationSpan] = &[
    span("911", "964", 1989, Some(1994)),
    span("911", "993", 1995, Some(1998)),
    span("911", "996", 1999, Some(2004)),
    span("911", "997.1", 2005, Some(2008)),
    span("911", "997.2", 2009, Some(2012)),
    span("911", "991.1", 2013, Some(2016)),
    span("911", "991.2", 2017, Some(2019)),
    span("911", "992.1", 2020, Some(2024)),
    span("911", "992.2", 2025, None),
    span("Cayman", "987.1", 2006, Some(2008)),
    span("Cayman", "987.2", 2009, Some(2012)),
    span("Cayman", "981", 2013, Some(2016)),
    span("Cayman", "982", 2017, None),
    span("Boxster", "986", 1997, Some(2004)),
    span("Boxster", "987.1", 2005, Some(2008)),
    span("Boxster", "987.2", 2009, Some(2012)),
    span("Boxster", "981", 2013, Some(2016)),
    span("Boxster", "982", 2017, None),
    span("Cayenne", "955", 2003, Some(2007)),
    span("Cayenne", "957", 2008, Some(2010)),
    span("Cayenne", "958.1", 2011, Some(2014)),
    span("Cayenne", "958.2", 2015, Some(2018)),
    span("Cayenne", "9Y0", 2019, None),
    span("Macan", "95B.1", 2015, Some(2018)),
    span("Macan", "95B.2", 2019, Some(2021)),
    span("Macan", "95B.3", 2022, None),
    span("Panamera", "970.1", 2010, Some(2013)),
    span("Panamera", "970.2", 2014, Some(2016)),
    span("Panamera", "971.1", 2017, Some(2020)),
    span("Panamera", "971.2", 2021, Some(2023)),
    span("Panamera", "976", 2024, None),
    span("Taycan", "J1.1", 2020, Some(2024)),
    span("Taycan", "J1.2", 2025, None),
];

fn spans_for<'a>(model: &'a str) -> impl Iterator<Item = &'static GenerationSpan> + 'a {
    GENERATIONS
        .iter()
        .filter(move |s| s.model.eq_ignore_ascii_case(model))
}

pub fn generation_for(model: &str, year: i32) -> Option<&'static str> {
    spans_for(model)
        .find(|s| s.contains(year))
        .map(|s| s.generation)
}

/// Resolves a literal title token ("991.2", "997", "9y0") to a generation of `model`.
/// A bare family token is narrowed by `year` when the year falls inside that family.
pub fn generation_from_token(model: &str, token: &str, year: Option<i32>) -> Option<String> {
    if let Some(exact) = spans_for(model).find(|s| s.generation.eq_ignore_ascii_case(token)) {
        return Some(exact.generation.to_string());
    }

    let family = spans_for(model).find(|s| s.family().eq_ignore_ascii_case(token))?;
    let narrowed = year
        .and_then(|y| spans_for(model).find(|s| s.contains(y)))
        .filter(|s| s.family() == family.family());
    Some(
        narrowed
            .map(|s| s.generation)
            .unwrap_or(family.family())
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_never_overlap_within_a_model() {
        for (i, a) in GENERATIONS.iter().enumerate() {
            for b in GENERATIONS.iter().skip(i + 1) {
                if a.model != b.model {
                    continue;
                }
                let a_end = a.to.unwrap_or(i32::MAX);
                let b_end = b.to.unwrap_or(i32::MAX);
                assert!(
                    a_end < b.from || b_end < a.from,
                    "{} {} overlaps {}",
                    a.model,
                    a.generation,
                    b.generation
                );
            }
        }
    }

    #[test]
    fn year_lookup_uses_model_family_table() {
        assert_eq!(generation_for("911", 2016), Some("991.1"));
        assert_eq!(generation_for("911", 2017), Some("991.2"));
        assert_eq!(generation_for("cayman", 2019), Some("982"));
        assert_eq!(generation_for("911", 1970), None);
        assert_eq!(generation_for("Carrera GT", 2005), None);
    }

    #[test]
    fn tokens_resolve_exactly_or_by_family() {
        assert_eq!(generation_from_token("911", "991.1", Some(2019)).as_deref(), Some("991.1"));
        assert_eq!(generation_from_token("911", "991", Some(2018)).as_deref(), Some("991.2"));
        assert_eq!(generation_from_token("911", "991", None).as_deref(), Some("991"));
        assert_eq!(generation_from_token("911", "997", Some(2019)).as_deref(), Some("997"));
        assert_eq!(generation_from_token("Cayenne", "9y0", None).as_deref(), Some("9Y0"));
        assert_eq!(generation_from_token("911", "718", Some(2019)), None);
    }
}

/// A single step of a dotted access path such as `"a.b[0].c"`.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Parses a dotted path with optional integer indices (`"a.b[0].c"`) into a
/// sequence of [`Segment`]s. This is an interface convenience layered over
/// the `Value` tree, not a storage detail (§4.C).
pub fn parse(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for dotted in path.split('.') {
        if dotted.is_empty() {
            continue;
        }
        let mut rest = dotted;
        if let Some(bracket_pos) = rest.find('[') {
            let key = &rest[..bracket_pos];
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            rest = &rest[bracket_pos..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']').unwrap_or(stripped.len());
                if let Ok(idx) = stripped[..close].parse::<usize>() {
                    segments.push(Segment::Index(idx));
                }
                rest = if close + 1 <= stripped.len() {
                    &stripped[close + 1..]
                } else {
                    ""
                };
            }
        } else {
            segments.push(Segment::Key(rest.to_string()));
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_dotted_path() {
        assert_eq!(
            parse("a.b.c"),
            vec![
                Segment::Key("a".into()),
                Segment::Key("b".into()),
                Segment::Key("c".into())
            ]
        );
    }

    #[test]
    fn parses_indices() {
        assert_eq!(
            parse("a.b[0].c"),
            vec![
                Segment::Key("a".into()),
                Segment::Key("b".into()),
                Segment::Index(0),
                Segment::Key("c".into()),
            ]
        );
    }

    #[test]
    fn parses_chained_indices() {
        assert_eq!(
            parse("m[0][1]"),
            vec![
                Segment::Key("m".into()),
                Segment::Index(0),
                Segment::Index(1),
            ]
        );
    }
}

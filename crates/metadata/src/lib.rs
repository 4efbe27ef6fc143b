#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub title: String,
    pub year: Option<i32>,
}

/// Derives a display title and release year from a bare file name.
///
/// The first `(dddd)` group anywhere in the name is taken as the year and cut
/// out; the extension is dropped; dots and underscores become spaces. Never
/// fails: a name that reduces to nothing falls back to its stem.
pub fn parse_file_name(file_name: &str) -> ParsedName {
    let (without_year, year) = match find_year_group(file_name) {
        Some((start, year)) => {
            let mut rest = String::with_capacity(file_name.len());
            rest.push_str(&file_name[..start]);
            rest.push_str(&file_name[start + YEAR_GROUP_LEN..]);
            (rest, Some(year))
        }
        None => (file_name.to_string(), None),
    };

    let stem = strip_extension(&without_year);
    let title = collapse_whitespace(&stem.replace(['.', '_'], " "));
    if !title.is_empty() {
        return ParsedName { title, year };
    }

    let fallback = strip_extension(file_name).trim().to_string();
    ParsedName {
        title: if fallback.is_empty() {
            file_name.to_string()
        } else {
            fallback
        },
        year,
    }
}

const YEAR_GROUP_LEN: usize = 6;

fn find_year_group(input: &str) -> Option<(usize, i32)> {
    let bytes = input.as_bytes();
    if bytes.len() < YEAR_GROUP_LEN {
        return None;
    }
    for start in 0..=bytes.len() - YEAR_GROUP_LEN {
        let window = &bytes[start..start + YEAR_GROUP_LEN];
        if window[0] == b'('
            && window[5] == b')'
            && window[1..5].iter().all(|b| b.is_ascii_digit())
        {
            let year = std::str::from_utf8(&window[1..5]).ok()?.parse::<i32>().ok()?;
            return Some((start, year));
        }
    }
    None
}

fn strip_extension(input: &str) -> String {
    match input.rfind('.') {
        Some(idx) => {
            let ext = &input[idx + 1..];
            if ext.is_empty() || ext.chars().any(|c| c.is_whitespace() || c == '/') {
                input.to_string()
            } else {
                input[..idx].to_string()
            }
        }
        None => input.to_string(),
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

//! Business-card field structuring.
//!
//! Turns the text lines returned by OCR into a [`FieldMap`] with the usual
//! card fields: `name`, `company`, `job_title`, `email`, `phone`, `mobile`,
//! `fax`, `website`, `address`. Each line is claimed by at most one field,
//! contact details first, so a phone line never ends up as a name.
//!
//! The rules are keyword and shape checks. Fields that cannot be
//! recognized are left out.

use crate::models::{FieldMap, FieldValue};

const TITLE_WORDS: &[&str] = &[
    "ceo", "cto", "cfo", "coo", "vp", "president", "director", "manager", "engineer",
    "developer", "designer", "consultant", "architect", "analyst", "lead", "head", "founder",
    "officer", "specialist", "representative", "partner", "associate", "scientist",
    "executive", "administrator", "coordinator", "intern", "owner",
];

const COMPANY_WORDS: &[&str] = &[
    "inc", "inc.", "corp", "corp.", "corporation", "llc", "ltd", "ltd.", "co.", "gmbh",
    "company", "group", "technologies", "solutions", "labs", "systems", "partners", "plc",
    "ag", "s.a.", "holdings", "studio",
];

const STREET_WORDS: &[&str] = &[
    "st", "st.", "street", "ave", "ave.", "avenue", "rd", "rd.", "road", "blvd", "blvd.",
    "boulevard", "suite", "ste", "floor", "fl", "lane", "ln", "drive", "dr", "way", "plaza",
    "building", "bldg",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhoneKind {
    Phone,
    Mobile,
    Fax,
}

fn words(line: &str) -> Vec<String> {
    line.split(|c: char| c.is_whitespace() || c == ',' || c == '|')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn has_any(line: &str, vocabulary: &[&str]) -> bool {
    words(line).iter().any(|w| vocabulary.contains(&w.as_str()))
}

fn digit_count(s: &str) -> usize {
    s.chars().filter(|c| c.is_ascii_digit()).count()
}

fn find_email(line: &str) -> Option<String> {
    line.split_whitespace()
        .map(|t| t.trim_matches(|c: char| c == ',' || c == ';' || c == '<' || c == '>'))
        .map(|t| t.strip_prefix("mailto:").unwrap_or(t))
        .find(|t| {
            let Some((local, domain)) = t.split_once('@') else {
                return false;
            };
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        })
        .map(|t| t.to_string())
}

fn find_website(line: &str) -> Option<String> {
    line.split_whitespace()
        .map(|t| t.trim_matches(|c: char| c == ',' || c == ';'))
        .find(|t| {
            let lower = t.to_lowercase();
            !lower.contains('@')
                && (lower.starts_with("http://")
                    || lower.starts_with("https://")
                    || lower.starts_with("www."))
        })
        .map(|t| t.to_string())
}

/// Classify a line as a phone-ish line and strip its label.
fn find_phone(line: &str) -> Option<(PhoneKind, String)> {
    if digit_count(line) < 7 {
        return None;
    }
    let lower = line.to_lowercase();
    let labels: &[(&str, PhoneKind)] = &[
        ("mobile", PhoneKind::Mobile),
        ("cell", PhoneKind::Mobile),
        ("mob", PhoneKind::Mobile),
        ("m:", PhoneKind::Mobile),
        ("m.", PhoneKind::Mobile),
        ("fax", PhoneKind::Fax),
        ("f:", PhoneKind::Fax),
        ("f.", PhoneKind::Fax),
        ("tel", PhoneKind::Phone),
        ("phone", PhoneKind::Phone),
        ("office", PhoneKind::Phone),
        ("t:", PhoneKind::Phone),
        ("t.", PhoneKind::Phone),
        ("p:", PhoneKind::Phone),
    ];

    let (kind, rest) = labels
        .iter()
        .find(|(label, _)| lower.starts_with(label))
        .map(|(label, kind)| (*kind, line.get(label.len()..).unwrap_or(line)))
        .unwrap_or((PhoneKind::Phone, line));

    // Unlabelled lines must look like a number, not an address with a zip code
    let number: String = rest
        .trim_start_matches(|c: char| c.is_alphabetic() || c == ':' || c == '.')
        .trim()
        .to_string();
    let allowed = |c: char| c.is_ascii_digit() || " +-().ext".contains(c);
    if !number.chars().all(allowed) || digit_count(&number) < 7 {
        return None;
    }
    Some((kind, number))
}

/// Keep the first value seen for a field.
fn set(fields: &mut FieldMap, name: &str, value: String) {
    fields
        .entry(name.to_string())
        .or_insert(FieldValue::Text(value));
}

fn is_address(line: &str) -> bool {
    digit_count(line) > 0 && has_any(line, STREET_WORDS)
}

fn is_name_like(line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    (2..=4).contains(&parts.len())
        && parts.iter().all(|p| {
            p.chars()
                .all(|c| c.is_alphabetic() || c == '.' || c == '-' || c == '\'')
                && p.chars().next().is_some_and(|c| c.is_uppercase())
        })
}

/// Structure OCR text lines into business-card fields.
pub fn parse_card(lines: &[String]) -> FieldMap {
    let mut fields = FieldMap::new();
    let mut claimed = vec![false; lines.len()];
    let mut address_lines = Vec::new();

    for (i, raw) in lines.iter().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            claimed[i] = true;
            continue;
        }

        if let Some(email) = find_email(line) {
            set(&mut fields, "email", email);
            claimed[i] = true;
            if let Some(site) = find_website(line) {
                set(&mut fields, "website", site);
            }
            continue;
        }
        if let Some(site) = find_website(line) {
            set(&mut fields, "website", site);
            claimed[i] = true;
            continue;
        }
        if let Some((kind, number)) = find_phone(line) {
            let name = match kind {
                PhoneKind::Phone => "phone",
                PhoneKind::Mobile => "mobile",
                PhoneKind::Fax => "fax",
            };
            set(&mut fields, name, number);
            claimed[i] = true;
            continue;
        }
        if is_address(line) {
            address_lines.push(line.to_string());
            claimed[i] = true;
        }
    }

    if !address_lines.is_empty() {
        fields.insert(
            "address".to_string(),
            FieldValue::Text(address_lines.join(", ")),
        );
    }

    for (i, raw) in lines.iter().enumerate() {
        if claimed[i] {
            continue;
        }
        let line = raw.trim();
        if !fields.contains_key("company") && has_any(line, COMPANY_WORDS) {
            set(&mut fields, "company", line.to_string());
            claimed[i] = true;
        } else if !fields.contains_key("job_title") && has_any(line, TITLE_WORDS) {
            set(&mut fields, "job_title", line.to_string());
            claimed[i] = true;
        }
    }

    for (i, raw) in lines.iter().enumerate() {
        if claimed[i] {
            continue;
        }
        let line = raw.trim();
        if !fields.contains_key("name") && is_name_like(line) {
            set(&mut fields, "name", line.to_string());
            claimed[i] = true;
        }
    }

    // Fall back to the first leftover line for the company
    if !fields.contains_key("company") {
        if let Some(i) = (0..lines.len()).find(|&i| !claimed[i]) {
            set(&mut fields, "company", lines[i].trim().to_string());
        }
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(|l| l.to_string()).collect()
    }

    fn text<'a>(fields: &'a FieldMap, name: &str) -> Option<&'a str> {
        fields.get(name).and_then(FieldValue::as_text)
    }

    #[test]
    fn parses_typical_card() {
        let fields = parse_card(&lines(
            "Jane Doe\n\
             Senior Software Engineer\n\
             Acme Corp\n\
             123 Main Street, Suite 400\n\
             Springfield, IL 62704\n\
             Tel: +1 (555) 010-2000\n\
             Mobile: +1 555 010 3000\n\
             Fax: +1 555 010 4000\n\
             jane.doe@acme.example\n\
             www.acme.example",
        ));

        assert_eq!(text(&fields, "name"), Some("Jane Doe"));
        assert_eq!(text(&fields, "job_title"), Some("Senior Software Engineer"));
        assert_eq!(text(&fields, "company"), Some("Acme Corp"));
        assert_eq!(text(&fields, "email"), Some("jane.doe@acme.example"));
        assert_eq!(text(&fields, "website"), Some("www.acme.example"));
        assert_eq!(text(&fields, "phone"), Some("+1 (555) 010-2000"));
        assert_eq!(text(&fields, "mobile"), Some("+1 555 010 3000"));
        assert_eq!(text(&fields, "fax"), Some("+1 555 010 4000"));
        assert_eq!(text(&fields, "address"), Some("123 Main Street, Suite 400"));
    }

    #[test]
    fn unlabelled_number_is_phone() {
        let fields = parse_card(&lines("John Roe\n555-010-9999"));
        assert_eq!(text(&fields, "phone"), Some("555-010-9999"));
        assert_eq!(text(&fields, "name"), Some("John Roe"));
    }

    #[test]
    fn unknown_text_is_left_out() {
        let fields = parse_card(&lines("\n  \n"));
        assert!(fields.is_empty());
    }

    #[test]
    fn first_value_wins_for_repeated_fields() {
        let fields = parse_card(&lines("a@one.example\nb@two.example"));
        assert_eq!(text(&fields, "email"), Some("a@one.example"));
    }
}

//! Parser for GRUB menuentry configuration files using nom combinators.

use std::fmt::Display;

use nom::{
    bytes::complete::{escaped, tag, take_until},
    character::complete::{multispace0, multispace1, none_of},
    error::{Error, ErrorKind, ParseError},
    sequence::delimited,
    Err, IResult, Parser,
};

/// Body content of a GRUB menuentry containing parsed commands.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MenuentryBody<'a> {
    /// Arguments of the `linux` command: kernel path then command line
    pub(crate) linux: &'a str,
    /// Arguments of the `initrd` command
    pub(crate) initrd: &'a str,
    /// Additional commands
    pub(crate) extra: Vec<(&'a str, &'a str)>,
}

impl<'a> Display for MenuentryBody<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (k, v) in &self.extra {
            writeln!(f, "  {k} {v}")?;
        }
        writeln!(f, "  linux {}", self.linux)?;
        writeln!(f, "  initrd {}", self.initrd)
    }
}

impl<'a> From<Vec<(&'a str, &'a str)>> for MenuentryBody<'a> {
    fn from(vec: Vec<(&'a str, &'a str)>) -> Self {
        let mut entry = Self {
            linux: "",
            initrd: "",
            extra: vec![],
        };

        for (key, value) in vec {
            match key {
                "linux" => entry.linux = value,
                "initrd" => entry.initrd = value,
                _ => entry.extra.push((key, value)),
            }
        }

        entry
    }
}

/// A complete GRUB menuentry with title and body commands.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MenuEntry<'a> {
    /// Display title (supports escaped quotes)
    pub(crate) title: String,
    /// Commands within the menuentry block
    pub(crate) body: MenuentryBody<'a>,
}

impl<'a> Display for MenuEntry<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "menuentry \"{}\" {{", self.title)?;
        write!(f, "{}", self.body)?;
        writeln!(f, "}}")
    }
}

/// Parser that takes content until balanced brackets, handling nested brackets and escapes.
fn take_until_balanced_allow_nested(
    opening_bracket: char,
    closing_bracket: char,
) -> impl Fn(&str) -> IResult<&str, &str> {
    move |i: &str| {
        let mut index = 0;
        let mut bracket_counter = 0;

        while let Some(n) = &i[index..].find(&[opening_bracket, closing_bracket, '\\'][..]) {
            index += n;
            let mut characters = i[index..].chars();

            match characters.next().unwrap_or_default() {
                c if c == '\\' => {
                    // Skip '\'
                    index += '\\'.len_utf8();
                    // Skip char following '\'
                    let c = characters.next().unwrap_or_default();
                    index += c.len_utf8();
                }

                c if c == opening_bracket => {
                    bracket_counter += 1;
                    index += opening_bracket.len_utf8();
                }

                c if c == closing_bracket => {
                    bracket_counter -= 1;
                    index += closing_bracket.len_utf8();
                }

                // Should not happen
                _ => unreachable!(),
            };

            // We found the unmatched closing bracket.
            if bracket_counter == -1 {
                // Don't consume it as we'll "tag" it afterwards
                index -= closing_bracket.len_utf8();
                return Ok((&i[index..], &i[0..index]));
            };
        }

        if bracket_counter == 0 {
            Ok(("", i))
        } else {
            Err(Err::Error(Error::from_error_kind(i, ErrorKind::TakeUntil)))
        }
    }
}

/// Parses a single menuentry with title and body commands.
fn parse_menuentry(input: &str) -> IResult<&str, MenuEntry<'_>> {
    let (input, _) = tag("menuentry").parse(input)?;

    // Require at least one space after "menuentry"
    let (input, _) = multispace1.parse(input)?;
    // Eat up the title, handling escaped quotes
    let (input, title) = delimited(
        tag("\""),
        escaped(none_of("\\\""), '\\', none_of("")),
        tag("\""),
    )
    .parse(input)?;

    // Skip any whitespace after title
    let (input, _) = multispace0.parse(input)?;

    // Eat up everything insde { .. }
    let (input, body) = delimited(
        tag("{"),
        take_until_balanced_allow_nested('{', '}'),
        tag("}"),
    )
    .parse(input)?;

    let mut map = vec![];

    for line in body.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match line.split_once(' ') {
            Some((key, value)) => map.push((key, value.trim())),
            None => map.push((line, "")),
        }
    }

    Ok((
        input,
        MenuEntry {
            title: title.to_string(),
            body: MenuentryBody::from(map),
        },
    ))
}

/// Skips content until finding "menuentry" keyword or end of input.
fn skip_to_menuentry(input: &str) -> IResult<&str, ()> {
    let (input, _) = take_until("menuentry")(input)?;
    Ok((input, ()))
}

/// Parses all menuentries from a GRUB configuration file.
fn parse_all(input: &str) -> IResult<&str, Vec<MenuEntry<'_>>> {
    let mut remaining = input;
    let mut entries = Vec::new();

    // Skip any content before the first menuentry
    let Ok((new_input, _)) = skip_to_menuentry(remaining) else {
        return Ok(("", Default::default()));
    };
    remaining = new_input;

    while !remaining.trim().is_empty() {
        let (new_input, entry) = parse_menuentry(remaining)?;
        entries.push(entry);
        remaining = new_input;

        // Skip whitespace and try to find next menuentry
        let (ws_input, _) = multispace0(remaining)?;
        remaining = ws_input;

        if let Ok((next_input, _)) = skip_to_menuentry(remaining) {
            remaining = next_input;
        } else if !remaining.trim().is_empty() {
            // No more menuentries found, but content remains
            break;
        }
    }

    Ok((remaining, entries))
}

/// Main entry point for parsing GRUB menuentry files.
pub(crate) fn parse_grub_menuentry_file(contents: &str) -> anyhow::Result<Vec<MenuEntry<'_>>> {
    let (_, entries) = parse_all(contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse GRUB menuentries: {e}"))?;
    // Validate that entries have reasonable structure
    for entry in &entries {
        if entry.title.is_empty() {
            anyhow::bail!("Found menuentry with empty title");
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_menuconfig_parser() {
        let menuentry = r#"
            set default="A - bootslot v1.8.0"
            set timeout=3

            # Skip this comment

            menuentry "A - bootslot v1.8.0" {
              set gfxmode=auto
              set gfxpayload=text
              # This should also be skipped
              linux /A/vmlinuz console=tty0 bootslot.platform=metal
              initrd /A/initramfs.xz
            }

            menuentry "B - bootslot v1.7.2" {
              linux /B/vmlinuz
              initrd /B/initramfs.xz
            }
        "#;

        let result = parse_grub_menuentry_file(menuentry).expect("Expected parsed entries");

        let expected = vec![
            MenuEntry {
                title: "A - bootslot v1.8.0".into(),
                body: MenuentryBody {
                    linux: "/A/vmlinuz console=tty0 bootslot.platform=metal",
                    initrd: "/A/initramfs.xz",
                    extra: vec![("set", "gfxmode=auto"), ("set", "gfxpayload=text")],
                },
            },
            MenuEntry {
                title: "B - bootslot v1.7.2".into(),
                body: MenuentryBody {
                    linux: "/B/vmlinuz",
                    initrd: "/B/initramfs.xz",
                    extra: vec![],
                },
            },
        ];

        assert_eq!(result, expected);
    }

    #[test]
    fn test_display() {
        let entry = MenuEntry {
            title: "B - bootslot v2".into(),
            body: MenuentryBody {
                linux: "/B/vmlinuz quiet",
                initrd: "/B/initramfs.xz",
                extra: vec![("set", "gfxmode=auto")],
            },
        };
        let rendered = entry.to_string();
        similar_asserts::assert_eq!(
            rendered,
            indoc::indoc! { r#"
                menuentry "B - bootslot v2" {
                  set gfxmode=auto
                  linux /B/vmlinuz quiet
                  initrd /B/initramfs.xz
                }
            "# }
        );
        let reparsed = parse_grub_menuentry_file(&rendered).unwrap();
        assert_eq!(reparsed, vec![entry]);
    }

    #[test]
    fn test_escaped_quotes_in_title() {
        let menuentry = r#"
            menuentry "Title with \"escaped quotes\" inside" {
                linux /A/vmlinuz
            }
        "#;

        let result = parse_grub_menuentry_file(menuentry).expect("Expected parsed entries");

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].title, "Title with \\\"escaped quotes\\\" inside");
        assert_eq!(result[0].body.linux, "/A/vmlinuz");
    }

    #[test]
    fn test_nested_braces_in_body() {
        let menuentry = r#"
            menuentry "Nested Braces" {
                if [ -f ${config_directory}/test.cfg ]; then
                    source ${config_directory}/test.cfg
                fi
                linux /B/vmlinuz
            }
        "#;

        let result = parse_grub_menuentry_file(menuentry).expect("Expected parsed entries");

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].body.linux, "/B/vmlinuz");
        assert!(result[0].body.extra.iter().any(|(k, _)| k == &"if"));
    }

    #[test]
    fn test_empty_file() {
        let result = parse_grub_menuentry_file("").expect("Should handle empty file");
        assert_eq!(result.len(), 0);
    }

    #[test]
    fn test_malformed_menuentry_missing_quote() {
        let menuentry = r#"
            menuentry "Missing closing quote {
                linux /A/vmlinuz
            }
        "#;

        assert!(parse_grub_menuentry_file(menuentry).is_err());
    }

    #[test]
    fn test_malformed_menuentry_missing_brace() {
        let menuentry = r#"
            menuentry "Missing Brace" {
                linux /A/vmlinuz
        "#;

        assert!(parse_grub_menuentry_file(menuentry).is_err());
    }
}

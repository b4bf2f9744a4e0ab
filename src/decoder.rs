//! Recovers PowerShell `-EncodedCommand` scripts from process command lines.
//!
//! PowerShell accepts a script as Base64 of its UTF-16LE bytes. Decoding is a
//! two step transform: pull the payload out of the command line, then undo the
//! Base64 and UTF-16LE layers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

// `/` is left out: `xcopy /e` and friends would match
const FLAG_PREFIX: char = '-';

// Full parameter name; any prefix at least MIN_PREFIX_LEN long selects it
const ENCODED_COMMAND: &str = "encodedcommand";
const MIN_PREFIX_LEN: usize = 2; // "en"

// Short aliases that are not plain prefixes of the full name
const ENCODED_COMMAND_ALIASES: [&str; 2] = ["e", "ec"];

// One layer of quoting is stripped from the payload
const QUOTES: [char; 2] = ['"', '\''];

// Only these programs take -EncodedCommand; `sed -e`, `perl -e` must not match
const POWERSHELL_IMAGES: [&str; 2] = ["powershell", "pwsh"];
const EXE_SUFFIX: &str = ".exe";

/// Why a payload could not be turned back into script text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("invalid UTF-16LE: {0}")]
    InvalidEncoding(#[from] EncodingError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("odd byte count {0} is not a whole number of code units")]
    OddLength(usize),

    #[error("unpaired surrogate {unit:#06x} at code unit {offset}")]
    UnpairedSurrogate { unit: u16, offset: usize },
}

/// Script text recovered from an encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCommand {
    pub script: String,
    /// Number of UTF-16LE bytes the payload carried.
    pub byte_len: usize,
}

impl DecodedCommand {
    /// SHA-256 of the script's UTF-8 bytes, hex encoded.
    #[must_use]
    pub fn sha256(&self) -> String {
        hex::encode(Sha256::digest(self.script.as_bytes()))
    }
}

/// Finds the payload following an encoded-command flag.
///
/// Only PowerShell command lines are searched. The payload is the
/// whitespace-delimited token right after the flag, so it stops where the
/// next flag (`-inputFormat`, `-NoProfile`, ...) begins. A flag followed by
/// another flag or by nothing carries no payload.
pub fn extract_encoded_payload(command_line: &str) -> Option<&str> {
    let (program, args) = split_program(command_line)?;
    if !is_powershell(program) {
        return None;
    }

    let mut tokens = args.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if !is_encoded_command_flag(token) {
            continue;
        }
        let Some(next) = tokens.peek() else {
            break;
        };
        if next.starts_with(FLAG_PREFIX) {
            continue;
        }
        let payload = strip_quotes(next);
        if !payload.is_empty() {
            return Some(payload);
        }
    }

    None
}

/// Decodes a Base64 payload holding UTF-16LE text.
pub fn decode(payload: &str) -> Result<DecodedCommand, DecodeError> {
    let bytes = STANDARD.decode(payload)?;
    let script = utf16le_to_string(&bytes)?;
    Ok(DecodedCommand {
        script,
        byte_len: bytes.len(),
    })
}

/// `None` when the command line has no encoded payload at all.
pub fn decode_from_command_line(
    command_line: &str,
) -> Option<Result<DecodedCommand, DecodeError>> {
    extract_encoded_payload(command_line).map(decode)
}

/// Splits off the program token, which may be a quoted path with spaces.
fn split_program(command_line: &str) -> Option<(&str, &str)> {
    let line = command_line.trim_start();
    if let Some(rest) = line.strip_prefix('"') {
        let end = rest.find('"')?;
        return Some((&rest[..end], &rest[end + 1..]));
    }
    let end = line.find(char::is_whitespace).unwrap_or(line.len());
    Some((&line[..end], &line[end..]))
}

fn is_powershell(program: &str) -> bool {
    let image = program
        .rsplit(|c: char| c == '\\' || c == '/')
        .next()
        .unwrap_or(program)
        .to_ascii_lowercase();
    let image = image.strip_suffix(EXE_SUFFIX).unwrap_or(&image);
    POWERSHELL_IMAGES.contains(&image)
}

fn is_encoded_command_flag(token: &str) -> bool {
    let Some(name) = token.strip_prefix(FLAG_PREFIX) else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    if ENCODED_COMMAND_ALIASES.contains(&name.as_str()) {
        return true;
    }
    name.len() >= MIN_PREFIX_LEN && ENCODED_COMMAND.starts_with(&name)
}

fn strip_quotes(token: &str) -> &str {
    for quote in QUOTES {
        if token.len() >= 2 && token.starts_with(quote) && token.ends_with(quote) {
            return &token[1..token.len() - 1];
        }
    }
    token
}

fn utf16le_to_string(bytes: &[u8]) -> Result<String, EncodingError> {
    if bytes.len() % 2 != 0 {
        return Err(EncodingError::OddLength(bytes.len()));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    let mut script = String::with_capacity(units.len());
    let mut offset = 0;
    for decoded in char::decode_utf16(units.iter().copied()) {
        match decoded {
            Ok(c) => {
                script.push(c);
                offset += c.len_utf16();
            }
            Err(e) => {
                return Err(EncodingError::UnpairedSurrogate {
                    unit: e.unpaired_surrogate(),
                    offset,
                });
            }
        }
    }

    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE_SCRIPT: &str =
        "$i = 1; while ($i -le 10) { Write-Output \"Iteration $i\"; Start-Sleep -Seconds 60; $i++ }";
    const SAMPLE_PAYLOAD: &str = "JABpACAAPQAgADEAOwAgAHcAaABpAGwAZQAgACgAJABpACAALQBsAGUAIAAxADAAKQAgAHsAIABXAHIAaQB0AGUALQBPAHUAdABwAHUAdAAgACIASQB0AGUAcgBhAHQAaQBvAG4AIAAkAGkAIgA7ACAAUwB0AGEAcgB0AC0AUwBsAGUAZQBwACAALQBTAGUAYwBvAG4AZABzACAANgAwADsAIAAkAGkAKwArACAAfQA=";

    fn encode(text: &str) -> String {
        let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        STANDARD.encode(bytes)
    }

    #[test]
    fn test_extract_absent() {
        assert_eq!(
            extract_encoded_payload("powershell.exe -File script.ps1"),
            None
        );
        assert_eq!(extract_encoded_payload(""), None);
    }

    #[test]
    fn test_extract_stops_before_next_flag() {
        assert_eq!(
            extract_encoded_payload(
                "powershell.exe -encodedCommand AAA= -inputFormat xml -outputFormat text"
            ),
            Some("AAA=")
        );
    }

    #[test]
    fn test_extract_accepts_abbreviations() {
        for flag in ["-e", "-ec", "-en", "-enc", "-EncodedCommand", "-ENCODEDC"] {
            let line = format!("powershell.exe -NoProfile {} SQBBAD0AMQA=", flag);
            assert_eq!(extract_encoded_payload(&line), Some("SQBBAD0AMQA="), "{}", flag);
        }
    }

    #[test]
    fn test_extract_rejects_other_flags() {
        for flag in ["-ex", "-encodedArguments", "-Command", "-enx", "-encodedcommandx"] {
            let line = format!("powershell.exe {} AAA=", flag);
            assert_eq!(extract_encoded_payload(&line), None, "{}", flag);
        }
        assert_eq!(extract_encoded_payload("xcopy /e src dst"), None);
    }

    #[test]
    fn test_extract_ignores_other_programs() {
        for line in [
            "sed -e s/foo/bar/g input.txt",
            "grep -e needle12 /var/log/syslog",
            "perl -e 'print 1'",
            "/usr/bin/bash -e AAAA",
            "\"C:\\Tools\\powershell-helper.exe\" -enc AAAA",
            "\"C:\\Program Files\\PowerShell\\7\\pwsh.exe -enc AAAA",
        ] {
            assert_eq!(extract_encoded_payload(line), None, "{}", line);
        }
    }

    #[test]
    fn test_extract_program_forms() {
        for line in [
            "\"C:\\WINDOWS\\system32\\WindowsPowerShell\\v1.0\\powershell.exe\" -e AAAA",
            "C:\\WINDOWS\\system32\\WindowsPowerShell\\v1.0\\PowerShell.EXE -e AAAA",
            "/opt/microsoft/powershell/7/pwsh -e AAAA",
            "  pwsh -e AAAA",
            "powershell -e AAAA",
        ] {
            assert_eq!(extract_encoded_payload(line), Some("AAAA"), "{}", line);
        }
    }

    #[test]
    fn test_other_programs_are_not_present() {
        for line in ["sed -e s/foo/bar/g input.txt", "grep -e needle12 /var/log/syslog", "perl -e 'print 1'"] {
            assert_eq!(decode_from_command_line(line), None, "{}", line);
        }
    }

    #[test]
    fn test_extract_strips_quotes() {
        assert_eq!(
            extract_encoded_payload("\"C:\\Program Files\\PowerShell\\7\\pwsh.exe\" -enc \"AAA=\""),
            Some("AAA=")
        );
        assert_eq!(extract_encoded_payload("pwsh -enc 'AAA='"), Some("AAA="));
    }

    #[test]
    fn test_extract_marker_without_payload() {
        assert_eq!(extract_encoded_payload("powershell.exe -enc"), None);
        assert_eq!(extract_encoded_payload("powershell.exe -enc -NoProfile"), None);
        assert_eq!(extract_encoded_payload("powershell.exe -enc \"\""), None);
        assert_eq!(
            extract_encoded_payload("powershell.exe -enc -NoLogo -enc AAA="),
            Some("AAA=")
        );
    }

    #[test]
    fn test_decode_short_fragment() {
        let decoded = decode("SQBBAD0AMQA=").unwrap();
        assert_eq!(decoded.script, "IA=1");
        assert_eq!(decoded.byte_len, 8);
    }

    #[test]
    fn test_decode_invalid_base64() {
        assert!(matches!(
            decode("not-valid-base64!!"),
            Err(DecodeError::InvalidBase64(_))
        ));
        assert!(matches!(decode("AAA"), Err(DecodeError::InvalidBase64(_))));
    }

    #[test]
    fn test_decode_odd_length() {
        // "YWJj" is "abc"
        assert_eq!(
            decode("YWJj"),
            Err(DecodeError::InvalidEncoding(EncodingError::OddLength(3)))
        );
    }

    #[test]
    fn test_decode_unpaired_surrogate() {
        // lone high surrogate 0xd800
        assert_eq!(
            decode("ANg="),
            Err(DecodeError::InvalidEncoding(
                EncodingError::UnpairedSurrogate {
                    unit: 0xd800,
                    offset: 0,
                }
            ))
        );
        // lone low surrogate 0xdc00 after nothing, followed by 'A'
        assert!(matches!(
            decode("ANxBAA=="),
            Err(DecodeError::InvalidEncoding(
                EncodingError::UnpairedSurrogate { unit: 0xdc00, .. }
            ))
        ));
    }

    #[test]
    fn test_decode_surrogate_pairs() {
        let decoded = decode("aADpAGwAbABvACAAEycgAD3YAN4=").unwrap();
        assert_eq!(decoded.script, "héllo ✓ 😀");
    }

    #[test]
    fn test_decode_sample_command_line() {
        let line = format!(
            "\"C:\\WINDOWS\\system32\\WindowsPowerShell\\v1.0\\powershell.exe\" -NoLogo -NoProfile -NonInteractive -encodedCommand {} -inputFormat xml -outputFormat text",
            SAMPLE_PAYLOAD
        );
        let decoded = decode_from_command_line(&line).unwrap().unwrap();
        assert_eq!(decoded.script, SAMPLE_SCRIPT);
        assert_eq!(
            decoded.sha256(),
            "15fc893905f9099c58d42b4f3d3799d9f6e4a13109b0c394130a4da6ecd0bafe"
        );
    }

    #[test]
    fn test_decode_from_command_line_absent() {
        assert_eq!(decode_from_command_line("notepad.exe readme.txt"), None);
    }

    #[test]
    fn test_decode_from_command_line_failure() {
        assert!(matches!(
            decode_from_command_line("powershell -enc not-valid-base64!!"),
            Some(Err(DecodeError::InvalidBase64(_)))
        ));
    }

    #[test]
    fn test_empty_payload_is_not_absence() {
        assert_eq!(decode("").unwrap().script, "");
    }

    proptest! {
        #[test]
        fn test_round_trip(text in any::<String>()) {
            let decoded = decode(&encode(&text)).unwrap();
            prop_assert_eq!(decoded.script, text);
        }

        #[test]
        fn test_round_trip_through_command_line(text in "\\PC{1,64}") {
            let line = format!("powershell.exe -NoProfile -EncodedCommand {} -inputFormat text", encode(&text));
            let decoded = decode_from_command_line(&line).unwrap().unwrap();
            prop_assert_eq!(decoded.script, text);
        }
    }
}

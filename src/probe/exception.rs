//! Detection of service-side exception reports in response bodies.

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

const EXCEPTION_TEXT: &[u8] = b"ExceptionText";

/// The body could not be read as well-formed markup.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("malformed response body: {0}")]
pub struct MalformedBody(pub String);

/// Scan a response body for `ExceptionText` elements.
///
/// Matching ignores namespace prefixes. Returns the newline-joined text of all
/// matching elements, `None` when the document contains none, or an error when
/// the body is not a well-formed document.
pub fn find_exception_text(body: &str) -> Result<Option<String>, MalformedBody> {
    let mut reader = Reader::from_str(body);

    let mut depth: usize = 0;
    let mut saw_root = false;
    // Depth at which the currently open ExceptionText element started
    let mut capture_depth: Option<usize> = None;
    let mut current = String::new();
    let mut messages: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth == 0 && saw_root {
                    return Err(MalformedBody("multiple root elements".to_string()));
                }
                saw_root = true;
                depth += 1;
                if capture_depth.is_none() && e.local_name().as_ref() == EXCEPTION_TEXT {
                    capture_depth = Some(depth);
                    current.clear();
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 0 && saw_root {
                    return Err(MalformedBody("multiple root elements".to_string()));
                }
                saw_root = true;
                if capture_depth.is_none() && e.local_name().as_ref() == EXCEPTION_TEXT {
                    messages.push(String::new());
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return Err(MalformedBody("unbalanced end tag".to_string()));
                }
                if capture_depth == Some(depth) {
                    messages.push(current.trim().to_string());
                    capture_depth = None;
                }
                depth -= 1;
            }
            Ok(Event::Text(t)) => {
                if depth == 0 {
                    if !t.iter().all(u8::is_ascii_whitespace) {
                        return Err(MalformedBody("text outside of root element".to_string()));
                    }
                } else if capture_depth.is_some() {
                    let text = t.unescape().map_err(|e| MalformedBody(e.to_string()))?;
                    current.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if capture_depth.is_some() {
                    current.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(MalformedBody(e.to_string())),
        }
    }

    if !saw_root {
        return Err(MalformedBody("no root element".to_string()));
    }
    if depth != 0 {
        return Err(MalformedBody("unexpected end of document".to_string()));
    }

    if messages.is_empty() {
        Ok(None)
    } else {
        Ok(Some(messages.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXCEPTION_REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ows:ExceptionReport xmlns:ows="http://www.opengis.net/ows/1.1" version="1.0.0">
  <ows:Exception exceptionCode="InvalidParameterValue" locator="Identifier">
    <ows:ExceptionText>Process does not exist</ows:ExceptionText>
  </ows:Exception>
  <ows:Exception exceptionCode="NoApplicableCode">
    <ows:ExceptionText>Second &amp; last</ows:ExceptionText>
  </ows:Exception>
</ows:ExceptionReport>"#;

    #[test]
    fn test_exception_report_messages_joined() {
        let message = find_exception_text(EXCEPTION_REPORT).unwrap();
        assert_eq!(
            message.as_deref(),
            Some("Process does not exist\nSecond & last")
        );
    }

    #[test]
    fn test_unprefixed_exception_text() {
        let body = "<ExceptionReport><Exception><ExceptionText><![CDATA[raw <text>]]></ExceptionText></Exception></ExceptionReport>";
        assert_eq!(find_exception_text(body).unwrap().as_deref(), Some("raw <text>"));
    }

    #[test]
    fn test_regular_response_has_no_exception() {
        let body = r#"<wps:ExecuteResponse xmlns:wps="http://www.opengis.net/wps/1.0.0">
            <wps:Status><wps:ProcessSucceeded>done</wps:ProcessSucceeded></wps:Status>
        </wps:ExecuteResponse>"#;
        assert_eq!(find_exception_text(body).unwrap(), None);
    }

    #[test]
    fn test_malformed_bodies() {
        assert!(find_exception_text("").is_err());
        assert!(find_exception_text("Service Unavailable").is_err());
        assert!(find_exception_text("<html><body>").is_err());
        assert!(find_exception_text("<a></b>").is_err());
        assert!(find_exception_text("<a/><b/>").is_err());
    }
}

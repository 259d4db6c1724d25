//! DMARC aggregate report parsing.
//!
//! The XML is first deserialized into loose `Raw*` structs where every field is
//! optional text. [`validate`] is the only place that turns those into the
//! canonical [`Report`]: required fields missing there make the document
//! malformed, while out-of-range values are clamped and reported as
//! [`ParseWarning`]s so one bad field never discards an otherwise valid report.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::container::{decode_container, ContainerKind};
use super::error::ParseError;
use super::{
    Alignment, AuthResult, DkimResult, PolicyAction, PublishedPolicy, Record, Report, SpfResult,
};

/// A non-fatal problem found while validating a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    /// Dotted path of the offending field, e.g. `record[2].row.count`.
    pub field: String,
    pub message: String,
}

impl ParseWarning {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A validated report together with the warnings raised while building it.
#[derive(Debug, Clone)]
pub struct ParsedReport {
    pub report: Report,
    pub warnings: Vec<ParseWarning>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFeedback {
    report_metadata: Option<RawMetadata>,
    policy_published: Option<RawPolicy>,
    #[serde(default)]
    record: Vec<RawRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    org_name: Option<String>,
    email: Option<String>,
    extra_contact_info: Option<String>,
    report_id: Option<String>,
    date_range: Option<RawDateRange>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDateRange {
    begin: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPolicy {
    domain: Option<String>,
    adkim: Option<String>,
    aspf: Option<String>,
    p: Option<String>,
    sp: Option<String>,
    pct: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRecord {
    row: Option<RawRow>,
    identifiers: Option<RawIdentifiers>,
    auth_results: Option<RawAuthResults>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRow {
    source_ip: Option<String>,
    count: Option<String>,
    policy_evaluated: Option<RawPolicyEvaluated>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPolicyEvaluated {
    disposition: Option<String>,
    dkim: Option<String>,
    spf: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIdentifiers {
    header_from: Option<String>,
    envelope_from: Option<String>,
    envelope_to: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAuthResults {
    #[serde(default)]
    dkim: Vec<RawDkim>,
    #[serde(default)]
    spf: Vec<RawSpf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDkim {
    domain: Option<String>,
    selector: Option<String>,
    result: Option<String>,
    human_result: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSpf {
    domain: Option<String>,
    scope: Option<String>,
    result: Option<String>,
}

/// Decodes the container (plain, gzip, zip) and parses the report inside.
pub fn parse_document(data: &[u8], hint: Option<ContainerKind>) -> Result<ParsedReport, ParseError> {
    let xml_bytes = decode_container(data, hint)?;
    let xml = String::from_utf8(xml_bytes)?;
    parse_xml(&xml)
}

/// Parses report XML into the canonical structure.
pub fn parse_xml(xml: &str) -> Result<ParsedReport, ParseError> {
    let xml = xml.trim_start_matches('\u{feff}');
    let raw: RawFeedback = quick_xml::de::from_str(xml)?;
    let parsed = validate(raw, xml.to_string())?;
    debug!(
        report_id = %parsed.report.report_id,
        records = parsed.report.records.len(),
        warnings = parsed.warnings.len(),
        "Parsed report"
    );
    Ok(parsed)
}

fn validate(raw: RawFeedback, raw_xml: String) -> Result<ParsedReport, ParseError> {
    let mut warnings = Vec::new();

    let metadata = raw
        .report_metadata
        .ok_or(ParseError::MissingField("report_metadata"))?;
    let report_id = clean(metadata.report_id).ok_or(ParseError::MissingField("report_id"))?;

    let date_range = metadata
        .date_range
        .ok_or(ParseError::MissingField("date_range"))?;
    let mut begin = parse_timestamp(date_range.begin, "date_range.begin")?;
    let mut end = parse_timestamp(date_range.end, "date_range.end")?;
    if begin > end {
        warnings.push(ParseWarning::new(
            "date_range",
            "begin is after end; swapped",
        ));
        std::mem::swap(&mut begin, &mut end);
    }

    let policy = validate_policy(
        raw.policy_published
            .ok_or(ParseError::MissingField("policy_published"))?,
        &mut warnings,
    )?;

    let mut records = Vec::with_capacity(raw.record.len());
    for (index, raw_record) in raw.record.into_iter().enumerate() {
        if let Some(record) = validate_record(raw_record, index, &mut warnings) {
            records.push(record);
        }
    }
    if records.is_empty() {
        return Err(ParseError::NoRecords);
    }

    Ok(ParsedReport {
        report: Report {
            org_name: clean(metadata.org_name),
            email: clean(metadata.email),
            extra_contact_info: clean(metadata.extra_contact_info),
            report_id,
            date_range_begin: begin,
            date_range_end: end,
            policy,
            records,
            raw_xml,
        },
        warnings,
    })
}

fn validate_policy(
    raw: RawPolicy,
    warnings: &mut Vec<ParseWarning>,
) -> Result<PublishedPolicy, ParseError> {
    let domain = clean(raw.domain)
        .ok_or(ParseError::MissingField("policy_published.domain"))?
        .to_ascii_lowercase();

    let p = match clean(raw.p) {
        Some(value) => value.parse().unwrap_or_else(|e: String| {
            warnings.push(ParseWarning::new("policy_published.p", format!("{}; using none", e)));
            PolicyAction::None
        }),
        None => {
            warnings.push(ParseWarning::new("policy_published.p", "missing; using none"));
            PolicyAction::None
        }
    };

    let sp = match clean(raw.sp) {
        Some(value) => value.parse().unwrap_or_else(|e: String| {
            warnings.push(ParseWarning::new(
                "policy_published.sp",
                format!("{}; using p", e),
            ));
            p
        }),
        None => p,
    };

    Ok(PublishedPolicy {
        domain,
        adkim: parse_alignment(raw.adkim, "policy_published.adkim", warnings),
        aspf: parse_alignment(raw.aspf, "policy_published.aspf", warnings),
        p,
        sp,
        pct: parse_pct(raw.pct, warnings),
    })
}

fn parse_alignment(
    value: Option<String>,
    field: &'static str,
    warnings: &mut Vec<ParseWarning>,
) -> Alignment {
    match clean(value) {
        Some(v) => v.parse().unwrap_or_else(|e: String| {
            warnings.push(ParseWarning::new(field, format!("{}; using relaxed", e)));
            Alignment::Relaxed
        }),
        None => Alignment::Relaxed,
    }
}

fn parse_pct(value: Option<String>, warnings: &mut Vec<ParseWarning>) -> u8 {
    let Some(value) = clean(value) else {
        return 100;
    };
    match value.parse::<i64>() {
        Ok(pct) if (0..=100).contains(&pct) => pct as u8,
        Ok(pct) => {
            let clamped = pct.clamp(0, 100);
            warnings.push(ParseWarning::new(
                "policy_published.pct",
                format!("{} out of range; clamped to {}", pct, clamped),
            ));
            clamped as u8
        }
        Err(_) => {
            warnings.push(ParseWarning::new(
                "policy_published.pct",
                format!("'{}' is not a number; using 100", value),
            ));
            100
        }
    }
}

fn validate_record(
    raw: RawRecord,
    index: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Option<Record> {
    let prefix = format!("record[{}]", index);
    let row = raw.row.unwrap_or_default();

    let Some(source_ip) = clean(row.source_ip) else {
        warnings.push(ParseWarning::new(
            format!("{}.row.source_ip", prefix),
            "missing; record dropped",
        ));
        return None;
    };
    let source_ip = match source_ip.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => {
            warnings.push(ParseWarning::new(
                format!("{}.row.source_ip", prefix),
                format!("'{}' is not an IP address", source_ip),
            ));
            source_ip
        }
    };

    let count = parse_count(row.count, &prefix, warnings);

    let evaluated = row.policy_evaluated.unwrap_or_default();
    let disposition = match clean(evaluated.disposition) {
        Some(value) => value.parse().unwrap_or_else(|e: String| {
            warnings.push(ParseWarning::new(
                format!("{}.row.policy_evaluated.disposition", prefix),
                format!("{}; using none", e),
            ));
            PolicyAction::None
        }),
        None => {
            warnings.push(ParseWarning::new(
                format!("{}.row.policy_evaluated.disposition", prefix),
                "missing; using none",
            ));
            PolicyAction::None
        }
    };

    let identifiers = raw.identifiers.unwrap_or_default();
    let header_from = clean(identifiers.header_from).map(|d| d.to_ascii_lowercase());
    let envelope_from = clean(identifiers.envelope_from).or_else(|| header_from.clone());

    let auth = raw.auth_results.unwrap_or_default();
    let dkim_results = auth
        .dkim
        .into_iter()
        .map(|d| DkimResult {
            domain: clean(d.domain).unwrap_or_default(),
            selector: clean(d.selector),
            result: auth_result(d.result),
            human_result: clean(d.human_result),
        })
        .collect();
    let spf_results = auth
        .spf
        .into_iter()
        .map(|s| SpfResult {
            domain: clean(s.domain).unwrap_or_default(),
            scope: clean(s.scope).unwrap_or_else(|| "mfrom".to_string()),
            result: auth_result(s.result),
        })
        .collect();

    Some(Record {
        source_ip,
        count,
        disposition,
        dkim: clean(evaluated.dkim).map(|v| AuthResult::parse(&v)),
        spf: clean(evaluated.spf).map(|v| AuthResult::parse(&v)),
        header_from,
        envelope_from,
        envelope_to: clean(identifiers.envelope_to),
        dkim_results,
        spf_results,
    })
}

fn parse_count(value: Option<String>, prefix: &str, warnings: &mut Vec<ParseWarning>) -> u32 {
    let field = format!("{}.row.count", prefix);
    let Some(value) = clean(value) else {
        warnings.push(ParseWarning::new(field, "missing; using 1"));
        return 1;
    };
    match value.parse::<i64>() {
        Ok(count) if count >= 1 => u32::try_from(count).unwrap_or_else(|_| {
            warnings.push(ParseWarning::new(
                field,
                format!("{} too large; clamped to {}", count, u32::MAX),
            ));
            u32::MAX
        }),
        Ok(count) => {
            warnings.push(ParseWarning::new(
                field,
                format!("{} below minimum; clamped to 1", count),
            ));
            1
        }
        Err(_) => {
            warnings.push(ParseWarning::new(
                field,
                format!("'{}' is not a number; using 1", value),
            ));
            1
        }
    }
}

fn parse_timestamp(value: Option<String>, field: &'static str) -> Result<DateTime<Utc>, ParseError> {
    let value = clean(value).ok_or(ParseError::MissingField(field))?;
    let secs = value.parse::<i64>().map_err(|_| ParseError::InvalidField {
        field,
        reason: format!("'{}' is not a Unix timestamp", value),
    })?;
    DateTime::from_timestamp(secs, 0).ok_or_else(|| ParseError::InvalidField {
        field,
        reason: format!("{} is out of range", secs),
    })
}

fn auth_result(value: Option<String>) -> AuthResult {
    clean(value)
        .map(|v| AuthResult::parse(&v))
        .unwrap_or(AuthResult::None)
}

/// Trims and drops empty values.
fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<feedback xmlns="urn:ietf:params:xml:ns:dmarc-2.0">
  <version>1.0</version>
  <report_metadata>
    <org_name>google.com</org_name>
    <email>noreply-dmarc-support@google.com</email>
    <extra_contact_info>https://support.google.com/a/answer/2466580</extra_contact_info>
    <report_id>5717107811868587391</report_id>
    <date_range>
      <begin>1609459200</begin>
      <end>1609545599</end>
    </date_range>
  </report_metadata>
  <policy_published>
    <domain>Example.com</domain>
    <adkim>s</adkim>
    <aspf>r</aspf>
    <p>quarantine</p>
    <pct>100</pct>
    <np>none</np>
  </policy_published>
  <record>
    <row>
      <source_ip>209.85.220.41</source_ip>
      <count>12</count>
      <policy_evaluated>
        <disposition>none</disposition>
        <dkim>pass</dkim>
        <spf>pass</spf>
      </policy_evaluated>
    </row>
    <identifiers>
      <header_from>example.com</header_from>
    </identifiers>
    <auth_results>
      <dkim>
        <domain>example.com</domain>
        <selector>google</selector>
        <result>pass</result>
      </dkim>
      <spf>
        <domain>example.com</domain>
        <result>pass</result>
      </spf>
      <dkim>
        <domain>mail.example.com</domain>
        <selector>s2</selector>
        <result>fail</result>
        <human_result>signature mismatch</human_result>
      </dkim>
    </auth_results>
  </record>
  <record>
    <row>
      <source_ip>2001:db8::1</source_ip>
      <count>3</count>
      <policy_evaluated>
        <disposition>reject</disposition>
        <dkim>fail</dkim>
        <spf>fail</spf>
        <reason><type>local_policy</type></reason>
      </policy_evaluated>
    </row>
    <identifiers>
      <envelope_to>example.net</envelope_to>
      <envelope_from>bounce.example.org</envelope_from>
      <header_from>example.com</header_from>
    </identifiers>
    <auth_results>
      <spf>
        <domain>bounce.example.org</domain>
        <scope>helo</scope>
        <result>softfail</result>
      </spf>
    </auth_results>
  </record>
</feedback>"#;

    fn sample_with(from: &str, to: &str) -> String {
        SAMPLE.replacen(from, to, 1)
    }

    #[test]
    fn parses_full_report() {
        let parsed = parse_xml(SAMPLE).unwrap();
        assert!(parsed.warnings.is_empty(), "{:?}", parsed.warnings);

        let report = parsed.report;
        assert_eq!(report.org_name.as_deref(), Some("google.com"));
        assert_eq!(report.report_id, "5717107811868587391");
        assert_eq!(report.date_range_begin.timestamp(), 1609459200);
        assert_eq!(report.date_range_end.timestamp(), 1609545599);
        assert_eq!(report.policy.domain, "example.com");
        assert_eq!(report.policy.adkim, Alignment::Strict);
        assert_eq!(report.policy.p, PolicyAction::Quarantine);
        assert_eq!(report.policy.sp, PolicyAction::Quarantine);
        assert_eq!(report.policy.pct, 100);
        assert_eq!(report.message_count(), 15);
        assert!(report.raw_xml.contains("5717107811868587391"));

        let first = &report.records[0];
        assert_eq!(first.count, 12);
        assert_eq!(first.dkim, Some(AuthResult::Pass));
        assert_eq!(first.envelope_from.as_deref(), Some("example.com"));
        assert_eq!(first.dkim_results.len(), 2);
        assert_eq!(first.dkim_results[1].result, AuthResult::Fail);
        assert_eq!(
            first.dkim_results[1].human_result.as_deref(),
            Some("signature mismatch")
        );
        assert_eq!(first.spf_results[0].scope, "mfrom");

        let second = &report.records[1];
        assert_eq!(second.disposition, PolicyAction::Reject);
        assert_eq!(second.envelope_from.as_deref(), Some("bounce.example.org"));
        assert_eq!(second.envelope_to.as_deref(), Some("example.net"));
        assert_eq!(second.spf_results[0].result, AuthResult::SoftFail);
        assert!(second.dkim_results.is_empty());
    }

    #[test]
    fn missing_report_id_is_malformed() {
        let xml = sample_with("<report_id>5717107811868587391</report_id>", "");
        assert!(matches!(
            parse_xml(&xml),
            Err(ParseError::MissingField("report_id"))
        ));
    }

    #[test]
    fn missing_domain_is_malformed() {
        let xml = sample_with("<domain>Example.com</domain>", "");
        assert!(matches!(
            parse_xml(&xml),
            Err(ParseError::MissingField("policy_published.domain"))
        ));
    }

    #[test]
    fn non_numeric_timestamp_is_malformed() {
        let xml = sample_with("<begin>1609459200</begin>", "<begin>yesterday</begin>");
        assert!(matches!(
            parse_xml(&xml),
            Err(ParseError::InvalidField {
                field: "date_range.begin",
                ..
            })
        ));
    }

    #[test]
    fn report_without_records_is_malformed() {
        let start = SAMPLE.find("<record>").unwrap();
        let end = SAMPLE.rfind("</record>").unwrap() + "</record>".len();
        let mut xml = SAMPLE.to_string();
        xml.replace_range(start..end, "");
        assert!(matches!(parse_xml(&xml), Err(ParseError::NoRecords)));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(parse_xml("<feedback><report_metadata>").is_err());
        assert!(parse_document(b"not a report", None).is_err());
    }

    #[test]
    fn out_of_range_values_are_clamped_with_warnings() {
        let xml = sample_with("<count>12</count>", "<count>0</count>")
            .replacen("<pct>100</pct>", "<pct>250</pct>", 1);
        let parsed = parse_xml(&xml).unwrap();

        assert_eq!(parsed.report.records[0].count, 1);
        assert_eq!(parsed.report.policy.pct, 100);
        assert_eq!(parsed.warnings.len(), 2);
        assert!(parsed
            .warnings
            .iter()
            .any(|w| w.field == "record[0].row.count"));
        assert!(parsed
            .warnings
            .iter()
            .any(|w| w.field == "policy_published.pct"));
    }

    #[test]
    fn unparseable_count_falls_back_to_one() {
        let xml = sample_with("<count>12</count>", "<count>lots</count>");
        let parsed = parse_xml(&xml).unwrap();
        assert_eq!(parsed.report.records[0].count, 1);
        assert_eq!(parsed.warnings.len(), 1);
    }

    #[test]
    fn record_without_source_ip_is_dropped() {
        let xml = sample_with("<source_ip>2001:db8::1</source_ip>", "");
        let parsed = parse_xml(&xml).unwrap();
        assert_eq!(parsed.report.records.len(), 1);
        assert_eq!(parsed.warnings[0].field, "record[1].row.source_ip");
    }

    #[test]
    fn source_ip_is_stored_in_canonical_form() {
        let cases = [
            ("2001:DB8::1", "2001:db8::1", 0),
            ("2001:0db8:0:0:0:0:0:1", "2001:db8::1", 0),
            ("not-an-ip", "not-an-ip", 1),
        ];
        for (raw, expected, warnings) in cases {
            let xml = sample_with(
                "<source_ip>2001:db8::1</source_ip>",
                &format!("<source_ip>{}</source_ip>", raw),
            );
            let parsed = parse_xml(&xml).unwrap();
            assert_eq!(parsed.report.records[1].source_ip, expected, "{}", raw);
            assert_eq!(parsed.warnings.len(), warnings, "{}", raw);
        }
    }

    #[test]
    fn swapped_date_range_is_repaired() {
        let xml = sample_with("<begin>1609459200</begin>", "<begin>1609600000</begin>");
        let parsed = parse_xml(&xml).unwrap();
        assert!(parsed.report.date_range_begin < parsed.report.date_range_end);
        assert_eq!(parsed.report.date_range_end.timestamp(), 1609600000);
        assert_eq!(parsed.warnings[0].field, "date_range");
    }

    #[test]
    fn subdomain_policy_defaults_to_p_and_unknown_policy_warns() {
        let xml = sample_with("<p>quarantine</p>", "<p>monitor</p><sp>reject</sp>");
        let parsed = parse_xml(&xml).unwrap();
        assert_eq!(parsed.report.policy.p, PolicyAction::None);
        assert_eq!(parsed.report.policy.sp, PolicyAction::Reject);
        assert_eq!(parsed.warnings.len(), 1);
    }

    #[test]
    fn parses_gzipped_document() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(SAMPLE.as_bytes()).unwrap();
        let data = encoder.finish().unwrap();

        let parsed = parse_document(&data, Some(ContainerKind::Gzip)).unwrap();
        assert_eq!(parsed.report.records.len(), 2);
    }
}

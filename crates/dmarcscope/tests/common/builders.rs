//! Builders for report documents.

#![allow(dead_code)]

use std::io::{Cursor, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

/// One `<record>` row.
#[derive(Debug, Clone)]
pub struct RecordRow {
    pub source_ip: String,
    pub count: u64,
    pub disposition: &'static str,
    pub dkim: &'static str,
    pub spf: &'static str,
}

impl RecordRow {
    pub fn new(source_ip: &str, count: u64) -> Self {
        Self {
            source_ip: source_ip.to_string(),
            count,
            disposition: "none",
            dkim: "pass",
            spf: "pass",
        }
    }

    pub fn disposition(mut self, disposition: &'static str) -> Self {
        self.disposition = disposition;
        self
    }

    pub fn dkim(mut self, result: &'static str) -> Self {
        self.dkim = result;
        self
    }

    pub fn spf(mut self, result: &'static str) -> Self {
        self.spf = result;
        self
    }
}

/// Builder for aggregate report XML.
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    report_id: Option<String>,
    org_name: String,
    domain: String,
    begin: i64,
    end: i64,
    policy: &'static str,
    records: Vec<RecordRow>,
}

/// 2026-03-01T00:00:00Z
pub const MARCH_1: i64 = 1_772_323_200;
pub const DAY: i64 = 86_400;

impl ReportBuilder {
    pub fn new(report_id: &str, domain: &str) -> Self {
        Self {
            report_id: Some(report_id.to_string()),
            org_name: "google.com".to_string(),
            domain: domain.to_string(),
            begin: MARCH_1,
            end: MARCH_1 + DAY,
            policy: "none",
            records: Vec::new(),
        }
    }

    pub fn without_report_id(mut self) -> Self {
        self.report_id = None;
        self
    }

    pub fn org_name(mut self, org: &str) -> Self {
        self.org_name = org.to_string();
        self
    }

    pub fn period(mut self, begin: i64, end: i64) -> Self {
        self.begin = begin;
        self.end = end;
        self
    }

    /// A one-day period starting `day` days after March 1st.
    pub fn on_day(self, day: i64) -> Self {
        let begin = MARCH_1 + day * DAY;
        self.period(begin, begin + DAY)
    }

    pub fn policy(mut self, p: &'static str) -> Self {
        self.policy = p;
        self
    }

    pub fn record(mut self, record: RecordRow) -> Self {
        self.records.push(record);
        self
    }

    pub fn xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<feedback>\n");
        out.push_str("  <report_metadata>\n");
        out.push_str(&format!("    <org_name>{}</org_name>\n", self.org_name));
        out.push_str("    <email>noreply-dmarc-support@google.com</email>\n");
        if let Some(id) = &self.report_id {
            out.push_str(&format!("    <report_id>{}</report_id>\n", id));
        }
        out.push_str(&format!(
            "    <date_range><begin>{}</begin><end>{}</end></date_range>\n",
            self.begin, self.end
        ));
        out.push_str("  </report_metadata>\n");
        out.push_str(&format!(
            "  <policy_published><domain>{}</domain><adkim>r</adkim><aspf>r</aspf>\
             <p>{}</p><pct>100</pct></policy_published>\n",
            self.domain, self.policy
        ));
        for r in &self.records {
            out.push_str(&format!(
                "  <record>\n    <row><source_ip>{}</source_ip><count>{}</count>\
                 <policy_evaluated><disposition>{}</disposition><dkim>{}</dkim><spf>{}</spf>\
                 </policy_evaluated></row>\n    <identifiers><header_from>{}</header_from></identifiers>\n\
                 \x20   <auth_results><dkim><domain>{}</domain><selector>s1</selector><result>{}</result></dkim>\
                 <spf><domain>{}</domain><result>{}</result></spf></auth_results>\n  </record>\n",
                r.source_ip, r.count, r.disposition, r.dkim, r.spf,
                self.domain, self.domain, r.dkim, self.domain, r.spf
            ));
        }
        out.push_str("</feedback>\n");
        out
    }

    pub fn gzip(&self) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(self.xml().as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    pub fn zip(&self) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("report.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(self.xml().as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }
}

/// A report mail carrying the given XML documents as attachments.
pub fn report_mail(message_id: &str, attachments: &[(&str, String)]) -> Vec<u8> {
    let mut out = format!(
        "From: noreply-dmarc-support@google.com\r\n\
         To: dmarc@example.com\r\n\
         Subject: Report domain: example.com\r\n\
         Message-ID: <{}>\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"REPORT\"\r\n\r\n\
         --REPORT\r\nContent-Type: text/plain\r\n\r\nAggregate report attached.\r\n",
        message_id
    );
    for (filename, xml) in attachments {
        out.push_str(&format!(
            "--REPORT\r\nContent-Type: text/xml\r\n\
             Content-Disposition: attachment; filename=\"{}\"\r\n\r\n{}\r\n",
            filename, xml
        ));
    }
    out.push_str("--REPORT--\r\n");
    out.into_bytes()
}

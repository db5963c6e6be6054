//! Data line parsing.

use crate::{FieldMapping, LineError, LogRecord};

/// Parses one data line laid out according to `mapping`.
pub fn parse_line(mapping: &FieldMapping, line: &str) -> Result<LogRecord, LineError> {
    // <value> <value> ... with one value per column of the #Fields directive.
    let found = line.split_ascii_whitespace().count();
    if found != mapping.len() {
        return Err(LineError::FieldCountMismatch {
            expected: mapping.len(),
            found,
        });
    }

    let mut record = LogRecord::default();
    for (field, value) in mapping.fields().zip(line.split_ascii_whitespace()) {
        if let Some(field) = field {
            field.apply(&mut record, value)?;
        }
    }
    Ok(record)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use chrono::NaiveDate;

    use crate::Field;

    const IIS_FIELDS: &str = "date time s-sitename s-computername s-ip cs-method cs-uri-stem \
        cs-uri-query s-port cs-username c-ip cs(User-Agent) cs(Referer) sc-status sc-substatus \
        sc-win32-status sc-bytes cs-bytes time-taken";

    const IIS_LINE: &str = "2024-01-01 10:05:00 W3SVC1 WEB01 10.0.0.5 GET /api/orders \
        id=42&full=1 443 alice 192.168.1.20 Mozilla/5.0+(Windows+NT+10.0) \
        https://example.com/ 404 2 0 5120 731 16";

    fn iis_mapping() -> FieldMapping {
        FieldMapping::from_tokens(IIS_FIELDS.split_ascii_whitespace())
    }

    #[test]
    fn full_line() {
        let record = parse_line(&iis_mapping(), IIS_LINE).unwrap();
        assert_eq!(
            record.date_time(),
            NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(10, 5, 0)
                .unwrap()
        );
        assert_eq!(record.site_name, "W3SVC1");
        assert_eq!(record.computer_name, "WEB01");
        assert_eq!(record.source_ip, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))));
        assert_eq!(record.method, "GET");
        assert_eq!(record.uri_stem, "/api/orders");
        assert_eq!(record.uri_query, "id=42&full=1");
        assert_eq!(record.port, 443);
        assert_eq!(record.username, "alice");
        assert_eq!(record.client_ip, Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))));
        assert_eq!(record.user_agent, "Mozilla/5.0+(Windows+NT+10.0)");
        assert_eq!(record.referrer, "https://example.com/");
        assert_eq!(record.http_status, "404");
        assert_eq!(record.protocol_substatus, "2");
        assert_eq!(record.system_error_code, "0");
        assert_eq!(record.sent_bytes, 5120);
        assert_eq!(record.received_bytes, 731);
        assert_eq!(record.time_taken, 16);
    }

    #[test]
    fn round_trip() {
        let mapping = iis_mapping();
        let lines = [
            IIS_LINE,
            "2024-02-29 23:59:59 W3SVC2 WEB02 ::1 POST /login - 80 - 2001:db8::7 curl/8.0 - 500 0 64 0 0 1200",
        ];
        for line in lines {
            let record = parse_line(&mapping, line).unwrap();
            let rendered = mapping
                .fields()
                .map(|field| field.unwrap().render(&record))
                .collect::<Vec<_>>();
            assert_eq!(rendered, line.split_ascii_whitespace().collect::<Vec<_>>());
        }
    }

    #[test]
    fn absent_values() {
        let mapping = FieldMapping::from_tokens(["date", "time", "c-ip", "sc-bytes", "cs-uri-query"]);
        let record = parse_line(&mapping, "2024-01-01 00:00:01 - - -").unwrap();
        assert_eq!(record.client_ip, None);
        assert_eq!(record.sent_bytes, 0);
        assert_eq!(record.uri_query, "");
        assert_eq!(Field::SentBytes.render(&record), "0");
        assert_eq!(Field::UriQuery.render(&record), "-");
    }

    #[test]
    fn unknown_columns_are_ignored() {
        let mapping = FieldMapping::from_tokens(["date", "x-edge-location", "sc-status"]);
        let record = parse_line(&mapping, "2024-01-01 FRA2 200").unwrap();
        assert_eq!(record.http_status, "200");
    }

    #[test]
    fn missing_token() {
        let line = IIS_LINE.rsplit_once(' ').unwrap().0;
        match parse_line(&iis_mapping(), line) {
            Err(LineError::FieldCountMismatch { expected, found }) => {
                assert_eq!(expected, 19);
                assert_eq!(found, 18);
            }
            other => panic!("Unexpected result: {other:?}"),
        }
    }

    #[test]
    fn bad_number() {
        let mapping = FieldMapping::from_tokens(["date", "time", "time-taken"]);
        match parse_line(&mapping, "2024-01-01 10:00:00 fast") {
            Err(LineError::FieldValueInvalid { field, value, .. }) => {
                assert_eq!(field, "time-taken");
                assert_eq!(value, "fast");
            }
            other => panic!("Unexpected result: {other:?}"),
        }
    }
}

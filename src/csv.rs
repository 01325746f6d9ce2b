use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Amount;
use crate::ledger::Wallet;
use crate::model::{GroupId, Location, OfferId, OfferStatus, UserId};
use crate::script::Command;

/// Errors that can occur when reading scripts or writing wallets
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command '{op}'")]
    UnrecognizedCommand { line: usize, op: String },

    #[error("line {line}: {op} missing {field}")]
    MissingField {
        line: usize,
        op: String,
        field: &'static str,
    },

    #[error("line {line}: unknown offer status '{status}'")]
    UnknownStatus { line: usize, status: String },

    #[error("failed to write wallets: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush wallets: {0}")]
    Flush(#[from] io::Error),
}

/// Every column is optional; each command reads the ones it needs.
/// A script without an `address` column never geocodes.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InputRow {
    op: String,
    actor: Option<UserId>,
    name: Option<String>,
    trust: Option<f64>,
    group: Option<GroupId>,
    offer: Option<OfferId>,
    target: Option<u32>,
    member: Option<UserId>,
    amount: Option<f64>,
    lat: Option<f64>,
    lon: Option<f64>,
    status: Option<String>,
    reference: Option<String>,
    code: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    user: UserId,
    balance: String,
    locked: String,
    total: String,
}

/// Small helper to fetch a required column
fn required<T>(value: Option<T>, line: usize, op: &str, field: &'static str) -> Result<T, CsvError> {
    value.ok_or_else(|| CsvError::MissingField {
        line,
        op: op.to_string(),
        field,
    })
}

fn parse_status(status: Option<String>, line: usize) -> Result<OfferStatus, CsvError> {
    match status.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("approved") => Ok(OfferStatus::Approved),
        Some("pending") => Ok(OfferStatus::Pending),
        Some("rejected") => Ok(OfferStatus::Rejected),
        Some(other) => Err(CsvError::UnknownStatus {
            line,
            status: other.to_string(),
        }),
    }
}

fn coordinates(lat: Option<f64>, lon: Option<f64>) -> Location {
    match (lat, lon) {
        (Some(lat), Some(lon)) => Location::at(lat, lon),
        _ => Location::Unknown,
    }
}

fn parse_row(row: InputRow, line: usize) -> Result<Command, CsvError> {
    let op = row.op.to_ascii_lowercase();
    let actor = |row_actor: Option<UserId>| required(row_actor, line, &op, "actor");
    let group = |row_group: Option<GroupId>| required(row_group, line, &op, "group");

    let command = match op.as_str() {
        "user" => Command::RegisterUser {
            user: actor(row.actor)?,
            name: row.name.unwrap_or_default(),
            trust: required(row.trust, line, &op, "trust")?,
            location: coordinates(row.lat, row.lon),
            address: row.address.filter(|a| !a.is_empty()),
        },
        "place" => Command::Place {
            address: required(row.address, line, &op, "address")?,
            location: Location::at(
                required(row.lat, line, &op, "lat")?,
                required(row.lon, line, &op, "lon")?,
            ),
        },
        "offer" => Command::PublishOffer {
            offer: required(row.offer, line, &op, "offer")?,
            price: Amount::from_float(required(row.amount, line, &op, "amount")?),
            currency: row.name.unwrap_or_else(|| "INR".to_string()),
            status: parse_status(row.status, line)?,
        },
        "deposit" => Command::Deposit {
            user: actor(row.actor)?,
            amount: Amount::from_float(required(row.amount, line, &op, "amount")?),
            reference: row.reference.unwrap_or_else(|| format!("line-{line}")),
        },
        "create" => Command::Create {
            user: actor(row.actor)?,
            offer: required(row.offer, line, &op, "offer")?,
            target: required(row.target, line, &op, "target")?,
        },
        "join" => Command::Join {
            user: actor(row.actor)?,
            group: group(row.group)?,
        },
        "pay" => Command::Pay {
            user: actor(row.actor)?,
            group: group(row.group)?,
        },
        "order" => Command::Order {
            user: actor(row.actor)?,
            group: group(row.group)?,
        },
        "arrive" => Command::Arrive {
            user: actor(row.actor)?,
            group: group(row.group)?,
        },
        "reissue" => Command::Reissue {
            user: actor(row.actor)?,
            group: group(row.group)?,
        },
        "handoff" => Command::Handoff {
            receiver: actor(row.actor)?,
            group: group(row.group)?,
            member: required(row.member, line, &op, "member")?,
            code: row.code.filter(|c| !c.is_empty()),
        },
        _ => {
            return Err(CsvError::UnrecognizedCommand {
                line,
                op: row.op,
            });
        }
    };
    Ok(command)
}

/// Read scripted commands from a csv file
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(row, line)
        }))
}

/// Write wallets in csv format
pub fn write_wallets<'a>(
    writer: impl io::Write,
    wallets: impl IntoIterator<Item = &'a Wallet>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for wallet in wallets {
        let row = OutputRow {
            user: wallet.user(),
            balance: wallet.balance().to_string(),
            locked: wallet.locked().to_string(),
            total: wallet.total().to_string(),
        };
        writer.serialize(&row)?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "op,actor,name,trust,group,offer,target,member,amount,lat,lon,status,reference,code";

    fn write_csv(rows: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{HEADER}").unwrap();
        file.write_all(rows.as_bytes()).unwrap();
        file
    }

    fn read(rows: &str) -> Vec<Result<Command, CsvError>> {
        let file = write_csv(rows);
        read_commands(file.path()).unwrap().collect()
    }

    #[test]
    fn read_user_with_location() {
        let results = read("user,1,asha,55,,,,,,12.9,77.6,,,\n");
        assert_eq!(results.len(), 1);
        let command = results.into_iter().next().unwrap().unwrap();
        assert_eq!(
            command,
            Command::RegisterUser {
                user: 1,
                name: "asha".into(),
                trust: 55.0,
                location: Location::at(12.9, 77.6),
                address: None,
            }
        );
    }

    #[test]
    fn read_user_without_location_is_unknown() {
        let results = read("user,2,ravi,40,,,,,,,,,,\n");
        match results.into_iter().next().unwrap().unwrap() {
            Command::RegisterUser { location, .. } => assert_eq!(location, Location::Unknown),
            other => panic!("expected user, got {other:?}"),
        }
    }

    #[test]
    fn read_addresses_and_places() {
        let file = NamedTempFile::new().unwrap();
        let mut handle = file.reopen().unwrap();
        writeln!(handle, "op,actor,name,trust,lat,lon,address").unwrap();
        writeln!(handle, "place,,,,12.97,77.6,MG Road").unwrap();
        writeln!(handle, "user,3,meera,45,,,MG Road").unwrap();
        writeln!(handle, "place,,,,,,Indiranagar").unwrap();
        drop(handle);

        let results: Vec<_> = read_commands(file.path()).unwrap().collect();
        assert_eq!(
            results[0].as_ref().unwrap(),
            &Command::Place {
                address: "MG Road".into(),
                location: Location::at(12.97, 77.6),
            }
        );
        assert!(matches!(
            results[1].as_ref().unwrap(),
            Command::RegisterUser { location: Location::Unknown, address: Some(a), .. } if a == "MG Road"
        ));
        assert!(matches!(
            results[2].as_ref().unwrap_err(),
            CsvError::MissingField { line: 4, field: "lat", .. }
        ));
    }

    #[test]
    fn read_reissue() {
        let results = read("reissue,2,,,1,,,,,,,,,\n");
        assert_eq!(
            results[0].as_ref().unwrap(),
            &Command::Reissue { user: 2, group: 1 }
        );
    }

    #[test]
    fn read_offer_defaults_to_approved() {
        let results = read("offer,,,,,7,,,1000,,,,,\noffer,,,,,8,,,50,,,pending,,\n");
        assert_eq!(
            results[0].as_ref().unwrap(),
            &Command::PublishOffer {
                offer: 7,
                price: Amount::units(1000),
                currency: "INR".into(),
                status: OfferStatus::Approved,
            }
        );
        assert!(matches!(
            results[1].as_ref().unwrap(),
            Command::PublishOffer {
                status: OfferStatus::Pending,
                ..
            }
        ));
    }

    #[test]
    fn deposit_without_reference_uses_line() {
        let results = read("deposit,1,,,,,,,10.5,,,,,\ndeposit,1,,,,,,,2,,,,pay_9,\n");
        assert_eq!(
            results[0].as_ref().unwrap(),
            &Command::Deposit {
                user: 1,
                amount: Amount::from_float(10.5),
                reference: "line-2".into(),
            }
        );
        assert!(matches!(
            results[1].as_ref().unwrap(),
            Command::Deposit { reference, .. } if reference == "pay_9"
        ));
    }

    #[test]
    fn handoff_with_empty_code_uses_kept_code() {
        let results = read("handoff,1,,,3,,,2,,,,,,\nhandoff,1,,,3,,,2,,,,,,0042\n");
        assert_eq!(
            results[0].as_ref().unwrap(),
            &Command::Handoff {
                receiver: 1,
                group: 3,
                member: 2,
                code: None,
            }
        );
        assert!(matches!(
            results[1].as_ref().unwrap(),
            Command::Handoff { code: Some(code), .. } if code == "0042"
        ));
    }

    #[test]
    fn read_with_whitespace() {
        let results = read("join , 2 , , , 1 , , , , , , , , ,\n");
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].as_ref().unwrap(),
            &Command::Join { user: 2, group: 1 }
        );
    }

    #[test]
    fn unknown_command_is_reported_with_line() {
        let results = read("pay,1,,,1,,,,,,,,,\nrefund,1,,,1,,,,,,,,,\n");
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::UnrecognizedCommand { line: 3, .. }));
    }

    #[test]
    fn missing_field_is_reported() {
        let results = read("create,1,,,,7,,,,,,,,\n");
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(
            err,
            CsvError::MissingField {
                line: 2,
                field: "target",
                ..
            }
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let result = read_commands("/nonexistent/script.csv");
        assert!(matches!(result, Err(CsvError::Open { .. })));
    }

    #[test]
    fn write_wallet_rows() {
        let wallets = [crate::ledger::Wallet::new(4)];
        let mut out = Vec::new();
        write_wallets(&mut out, &wallets).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["user,balance,locked,total", "4,0.0000,0.0000,0.0000"]);
    }
}

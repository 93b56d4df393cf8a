use std::sync::Arc;
use std::time::Duration;

use lab_hl7::config::EngineConfig;
use lab_hl7::database::{DatabaseAdapter, SqliteAdapter};
use lab_hl7::device::DeviceModel;
use lab_hl7::mllp::{send_message, MessageHandler, MllpServer};
use lab_hl7::Message;

const ORDER: &str = "MSH|^~\\&|GenruiKT60|GenruiFacility|LIS|LIS|20230101120000||ORM^O01|ORD42|P|2.3.1\r\
ORC|RF||PATID777\r\
OBX|1|IS|08001^Take Mode^99MRC||O\r";

const RESULT: &str = "MSH|^~\\&|GenruiKT60|GenruiFacility|LIS|LIS|20230101120000||ORU^R01|MSGID009|P|2.3.1\r\
PID|1||NOPE1^^^MRN\r\
OBR|1|||CBC^Complete Blood Count\r\
OBX|1|NM|GENRUI-WBC^WBC^Genrui|1|9.5|10*9/L|4.0-10.0|N|||F\r";

async fn start_engine(config: EngineConfig) -> (MllpServer, String) {
    let database = Arc::new(SqliteAdapter::in_memory(config.mappings.storage.clone()));
    database.connect().unwrap();
    database
        .execute_script(
            "INSERT INTO patientinfo (patientid, patientnamear, patientsex, patientage, patientageunit, requestdate)
                 VALUES ('PATID777', 'Roe, Ann', 'Female', 41, 'Years', '2023-02-02 08:00:00');",
        )
        .unwrap();

    let device = config
        .device
        .model
        .build(&config.outbound, &config.mappings.hl7);
    let handler = MessageHandler::from_config(&config, device, database);
    let server = MllpServer::new("127.0.0.1:0", handler, 4096, 20);
    let addr = server.start().await.unwrap();
    (server, addr.to_string())
}

async fn exchange(address: &str, message: &str) -> Option<Message> {
    send_message(address, message, Duration::from_secs(5))
        .await
        .unwrap()
        .map(|reply| Message::from_bytes(&reply).unwrap())
}

#[tokio::test]
async fn order_request_returns_patient_demographics() {
    let (server, address) = start_engine(EngineConfig::default()).await;

    let reply = exchange(&address, ORDER).await.expect("no reply");
    assert_eq!(reply.message_type, "ORR^O02");
    assert_eq!(reply.get_segment("MSA").unwrap().value(2), Some("ORD42"));

    let pid = reply.get_segment("PID").unwrap();
    assert_eq!(pid.value(3), Some("PATID777"));
    assert_eq!(pid.value(5), Some("Roe^Ann"));
    assert_eq!(pid.value(8), Some("F"));

    server.stop().await;
}

#[tokio::test]
async fn result_without_request_is_an_application_error() {
    let (server, address) = start_engine(EngineConfig::default()).await;

    let reply = exchange(&address, RESULT).await.expect("no reply");
    let msa = reply.get_segment("MSA").unwrap();
    assert_eq!(msa.value(1), Some("AE"));
    assert_eq!(msa.value(2), Some("MSGID009"));
    assert!(msa.value(3).unwrap().contains("NOPE1"));

    server.stop().await;
}

#[tokio::test]
async fn unsupported_types_follow_configuration() {
    let adt = "MSH|^~\\&|GenruiKT60|GenruiFacility|||1||ADT^A01|ADT1|P|2.3.1\rPID|1||X\r";

    let (server, address) = start_engine(EngineConfig::default()).await;
    let silent = send_message(&address, adt, Duration::from_millis(500))
        .await
        .unwrap();
    assert!(silent.is_none());
    server.stop().await;

    let mut config = EngineConfig::default();
    config.server.reject_unsupported_messages = true;
    let (server, address) = start_engine(config).await;
    let reply = exchange(&address, adt).await.expect("no reply");
    assert_eq!(reply.get_segment("MSA").unwrap().value(1), Some("AR"));
    server.stop().await;
}

#[tokio::test]
async fn indexed_profile_is_selected_by_name() {
    let mut config = EngineConfig::default();
    config.device.model = "genrui_kt60_indexed".parse::<DeviceModel>().unwrap();
    let (server, address) = start_engine(config).await;

    let reply = exchange(&address, ORDER).await.expect("no reply");
    assert_eq!(reply.message_type, "ORR^O02");

    server.stop().await;
}

#[tokio::test]
async fn oversized_frame_closes_only_that_connection() {
    let (server, address) = start_engine(EngineConfig::default()).await;

    let huge = format!("{}NTE|1||{}\r", ORDER, "x".repeat(8192));
    assert!(send_message(&address, &huge, Duration::from_secs(2))
        .await
        .map(|reply| reply.is_none())
        .unwrap_or(true));

    // the listener keeps serving new connections
    assert!(exchange(&address, ORDER).await.is_some());

    server.stop().await;
}

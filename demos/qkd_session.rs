// qkd-shield/demos/qkd_session.rs

// Clean BB84 exchange followed by a record round trip.
use qkd_shield::{KeyStatus, QkdService, ServiceConfig};
use serde_json::{Value, json};
use std::error::Error;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("--- BB84 Key Exchange Example ---");

    // 1. Service context with default thresholds
    let service = QkdService::new(ServiceConfig::default())?;
    println!("\n[1] Service ready. Acceptance threshold: {:.1}% QBER", service.config().qber_threshold);

    // 2. Run the protocol over a clean channel
    println!("\n[2] Sending {} qubits...", service.config().default_key_length);
    let report = service.generate_default_key()?;
    let metrics = &report.metrics;
    println!("    Sifted bits:      {} ({:.1}% basis efficiency)", metrics.sifted_key_length, metrics.basis_efficiency);
    println!("    QBER:             {:.2}%", metrics.qber);
    println!("    Fidelity:         {:.2}%", metrics.fidelity);
    println!("    Final key length: {}", report.final_key_length);
    println!("    Basis matches in first 20 positions: {:?}", report.transcript.basis_matches);

    if report.status != KeyStatus::Success {
        println!("    Key rejected, nothing to encrypt.");
        return Ok(());
    }

    // 3. Encrypt a record with the derived key
    let record = json!({
        "patient_id": "P001",
        "name": "John Smith",
        "diagnosis": "Hypertension"
    });
    println!("\n[3] Encrypting record: {}", record);
    let envelope = service.encrypt_record(&record)?;
    println!("    Ciphertext: {}", envelope.ciphertext);
    println!("    Nonce:      {}", envelope.nonce);
    println!("    Tag:        {}", envelope.tag);

    // 4. Decrypt while the channel is still clean
    println!("\n[4] Decrypting...");
    let decrypted: Value = service.decrypt_record(&envelope)?;
    println!("    Decrypted record: {}", decrypted);
    assert_eq!(decrypted, record, "round trip should preserve the record");

    // 5. Status snapshot
    let status = service.security_status();
    println!("\n[5] Threat level: {:?}, key status: {:?}", status.threat_level, status.key_status);
    for event in &status.recent_events {
        println!("    [{:?}] {}: {}", event.severity, event.kind, event.message);
    }

    println!("\n--- Example Complete ---");
    Ok(())
}

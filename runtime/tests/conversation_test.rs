#![cfg(test)]

use std::thread;

use scrivener_runtime::{Mesh, Session, SessionError};

#[derive(Debug, Clone, PartialEq)]
enum Msg {
    Quote(i32),
    Counter(i32),
    Accept,
    Invoice(f64),
    Eta(String),
}

/// Seller quotes, buyer counters until the quote drops below 100, then accepts.
/// Afterwards the seller and a shipper report to the buyer in parallel.
#[test]
fn test_haggle_then_parallel_reports() {
    let mesh: Mesh<Msg> = Mesh::new(["Buyer", "Seller", "Shipper"]);
    let buyer = Session::new(mesh.endpoint("Buyer").unwrap());
    let seller = Session::new(mesh.endpoint("Seller").unwrap());
    let shipper = Session::new(mesh.endpoint("Shipper").unwrap());

    let seller = thread::spawn(move || -> Result<u32, SessionError> {
        let mut price = 130;
        let mut rounds = 0;
        loop {
            rounds += 1;
            seller.send("Buyer", "quote", Msg::Quote(price))?;
            match seller.wait_any("Buyer", &["counter", "accept"])? {
                0 => match seller.recv("Buyer", "counter")? {
                    Msg::Counter(offer) => price = (price + offer) / 2,
                    other => panic!("unexpected {:?}", other),
                },
                _ => {
                    assert_eq!(seller.recv("Buyer", "accept")?, Msg::Accept);
                    break;
                }
            }
        }
        seller.send("Buyer", "invoice", Msg::Invoice(f64::from(price)))?;
        seller.finish()?;
        Ok(rounds)
    });

    let shipper = thread::spawn(move || -> Result<(), SessionError> {
        shipper.send("Buyer", "eta", Msg::Eta("tomorrow".to_string()))?;
        shipper.finish()?;
        Ok(())
    });

    loop {
        match buyer.recv("Seller", "quote").unwrap() {
            Msg::Quote(price) if price >= 100 => buyer.send("Seller", "counter", Msg::Counter(60)).unwrap(),
            Msg::Quote(_) => {
                buyer.send("Seller", "accept", Msg::Accept).unwrap();
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    let (joiner, [invoice, eta]) = buyer.fork::<2>();
    let invoice = thread::spawn(move || {
        let msg = invoice.recv("Seller", "invoice").unwrap();
        (msg, invoice.complete_branch().unwrap())
    });
    let eta = thread::spawn(move || {
        let msg = eta.recv("Shipper", "eta").unwrap();
        (msg, eta.complete_branch().unwrap())
    });

    let (invoice_msg, invoice_done) = invoice.join().unwrap();
    let (eta_msg, eta_done) = eta.join().unwrap();
    assert!(matches!(invoice_msg, Msg::Invoice(total) if total < 100.0));
    assert_eq!(eta_msg, Msg::Eta("tomorrow".to_string()));
    assert_eq!((invoice_done.branch(), eta_done.branch()), (0, 1));

    let buyer = joiner.join().unwrap();
    assert_eq!(buyer.finish().unwrap().role(), "Buyer");
    assert_eq!(seller.join().unwrap().unwrap(), 2);
    shipper.join().unwrap().unwrap();
}

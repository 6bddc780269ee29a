use crate::sled_adapter::SledDb;
use crate::*;

fn test_suite(db: Db) -> Result<()> {
	let tree = db.open_tree("tree")?;

	let ka: &[u8] = &b"test"[..];
	let kb: &[u8] = &b"zwello"[..];
	let kint: &[u8] = &b"tz"[..];
	let va: &[u8] = &b"plop"[..];
	let vb: &[u8] = &b"plip"[..];
	let vc: &[u8] = &b"plup"[..];

	tree.insert(ka, va)?;
	assert_eq!(tree.get(ka)?, Some(va.to_vec()));

	let res = db.transaction::<_, (), _>(|mut tx| {
		assert_eq!(tx.get(&tree, ka)?, Some(va.to_vec()));
		tx.insert(&tree, ka, vb)?;
		assert_eq!(tx.get(&tree, ka)?, Some(vb.to_vec()));
		tx.commit(12)
	});
	assert!(matches!(res, Ok(12)));
	assert_eq!(tree.get(ka)?, Some(vb.to_vec()));

	let res = db.transaction::<(), _, _>(|mut tx| {
		tx.insert(&tree, ka, vc)?;
		tx.abort(42)
	});
	assert!(matches!(res, Err(TxError::Abort(42))));
	assert_eq!(tree.get(ka)?, Some(vb.to_vec()));

	tree.insert(kb, vc)?;
	let mut iter = tree.iter()?;
	assert_eq!(iter.next().unwrap().unwrap(), (ka.to_vec(), vb.to_vec()));
	assert_eq!(iter.next().unwrap().unwrap(), (kb.to_vec(), vc.to_vec()));
	assert!(iter.next().is_none());

	let mut iter = tree.range(kint..)?;
	assert_eq!(iter.next().unwrap().unwrap(), (kb.to_vec(), vc.to_vec()));
	assert!(iter.next().is_none());

	Ok(())
}

#[test]
fn test_sled_db() -> Result<()> {
	let path = mktemp::Temp::new_dir().unwrap();
	let db = SledDb::new(sled::open(path.to_path_buf()).unwrap());
	test_suite(db)?;
	drop(path);
	Ok(())
}

#![no_main]
use chunkfile_rs::{Extent, FileConfig, HandleRegistry};
use libfuzzer_sys::{
    arbitrary::{Arbitrary, Unstructured},
    fuzz_target,
};

#[derive(Debug, Arbitrary)]
enum FileOp {
    Write { offset: u16, data: Vec<u8> },
    Del { offset: u16, size: u8 },
    DelToEnd { offset: u16 },
    Truncate { offset: u16 },
    Read { offset: u16, size: u8 },
    Suspend,
}

// Random operation sequences must agree with a flat buffer
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let chunk_size = match u.int_in_range(1u64..=64) {
        Ok(size) => size,
        Err(_) => return,
    };
    let ops: Vec<FileOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let file = HandleRegistry::in_memory()
            .create_file("fuzz.bin", FileConfig::new().chunk_size(chunk_size))
            .unwrap();
        let mut model: Vec<u8> = Vec::new();

        for op in ops.iter().take(64) {
            match op {
                FileOp::Write { offset, data } => {
                    let offset = *offset as usize;
                    file.write(offset as u64, data.clone()).await.unwrap();
                    if !data.is_empty() {
                        let end = offset + data.len();
                        if model.len() < end {
                            model.resize(end, 0);
                        }
                        model[offset..end].copy_from_slice(data);
                    }
                }
                FileOp::Del { offset, size } => {
                    let (offset, size) = (*offset as usize, *size as usize);
                    file.del(offset as u64, size as u64).await.unwrap();
                    if size > 0 {
                        if offset + size >= model.len() {
                            model.resize(offset, 0);
                        } else {
                            model[offset..offset + size].fill(0);
                        }
                    }
                }
                FileOp::DelToEnd { offset } => {
                    file.del(*offset as u64, Extent::ToEnd).await.unwrap();
                    model.resize(*offset as usize, 0);
                }
                FileOp::Truncate { offset } => {
                    file.truncate(*offset as u64).await.unwrap();
                    model.resize(*offset as usize, 0);
                }
                FileOp::Read { offset, size } => {
                    let (offset, size) = (*offset as usize, *size as usize);
                    let result = file.read(offset as u64, size as u64).await;
                    if size == 0 {
                        assert!(result.unwrap().is_empty());
                    } else if model.is_empty() || offset + size > model.len() {
                        assert!(result.is_err());
                    } else {
                        assert_eq!(result.unwrap(), &model[offset..offset + size]);
                    }
                }
                FileOp::Suspend => file.suspend().await.unwrap(),
            }
            assert_eq!(file.length(), model.len() as u64);
        }
    });
});

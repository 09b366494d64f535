use coroplus::{Control, Coroutine, Payload};

fn main() {
    let coroutine = Coroutine::new(|control: &Control| -> coroplus::Result<()> {
        let i: i32 = control.suspend_as(Payload::empty())?;
        println!("[coroutine] got {} from main", i);
        let reply = format!("{} received", i);
        control.suspend_with(reply)?;
        Ok(())
    })
    .unwrap();

    coroutine.resume().unwrap();
    println!("[main] passing 42 to coroutine");
    let reply: String = coroutine.resume_as(Payload::new(42i32)).unwrap();
    println!("[main] coroutine replied {:?}", reply);
    coroutine.resume().unwrap();
}

#[test]
fn transfer() {
    main()
}
